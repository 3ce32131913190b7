use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub mod models;
pub mod store;

use crate::error::{SyncError, SyncResult};
use models::*;
pub use store::{CacheStore, LockStore};

/// SQLite caps bound parameters per statement; stay well below it.
const MAX_IDS_PER_QUERY: usize = 500;

/// Shared SQLite handle (single connection behind a mutex) implementing both
/// the cache table and the lock table.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> SyncResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        // Several poller processes may share one file
        conn.busy_timeout(Duration::from_secs(5))?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> SyncResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn conn(&self) -> SyncResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Store("sqlite connection mutex poisoned".into()))
    }

    // ── Game cache ───────────────────────────────────────────────────────────

    /// Number of games currently cached.
    pub fn cached_game_count(&self) -> SyncResult<i64> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM game_cache", [], |r| r.get(0))?;
        Ok(count)
    }

    /// Fetch one cached game.
    #[allow(dead_code)]
    pub fn get_cached(&self, game_id: &str) -> SyncResult<Option<CacheRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT game_id, score_json, hash, starts_at, updated_at
                 FROM game_cache WHERE game_id = ?1",
                params![game_id],
                map_cache_row,
            )
            .optional()?;
        row.map(CacheRow::into_record).transpose()
    }
}

#[async_trait]
impl CacheStore for Database {
    async fn read_hashes(&self, ids: &[String]) -> SyncResult<HashMap<String, String>> {
        let mut hashes = HashMap::with_capacity(ids.len());
        if ids.is_empty() {
            return Ok(hashes);
        }
        let conn = self.conn()?;
        for chunk in ids.chunks(MAX_IDS_PER_QUERY) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT game_id, hash FROM game_cache WHERE game_id IN ({})",
                placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (id, hash) = row?;
                hashes.insert(id, hash);
            }
        }
        Ok(hashes)
    }

    async fn upsert_many(&self, records: &[CacheRecord]) -> SyncResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO game_cache (game_id, score_json, hash, starts_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(game_id) DO UPDATE SET
                    score_json=excluded.score_json,
                    hash=excluded.hash,
                    starts_at=excluded.starts_at,
                    updated_at=excluded.updated_at",
            )?;
            for rec in records {
                let score_json = serde_json::to_string(&rec.score_json)?;
                stmt.execute(params![
                    rec.game_id,
                    score_json,
                    rec.hash,
                    rec.starts_at,
                    rec.updated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

// ── Leader lock ────────────────────────────────────────────────────────────────

#[async_trait]
impl LockStore for Database {
    async fn try_insert(
        &self,
        key: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> SyncResult<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "INSERT INTO leader_lock (key, owner, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO NOTHING",
            params![key, owner, expires_at.timestamp_millis()],
        )?;
        Ok(n == 1)
    }

    async fn try_steal_expired(
        &self,
        key: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SyncResult<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE leader_lock SET owner=?2, expires_at=?3 WHERE key=?1 AND expires_at < ?4",
            params![
                key,
                owner,
                expires_at.timestamp_millis(),
                now.timestamp_millis()
            ],
        )?;
        Ok(n == 1)
    }

    async fn renew(
        &self,
        key: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> SyncResult<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE leader_lock SET expires_at=?3 WHERE key=?1 AND owner=?2",
            params![key, owner, expires_at.timestamp_millis()],
        )?;
        Ok(n == 1)
    }

    async fn release(&self, key: &str, owner: &str) -> SyncResult<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM leader_lock WHERE key=?1 AND owner=?2",
            params![key, owner],
        )?;
        Ok(n == 1)
    }

    async fn current(&self, key: &str) -> SyncResult<Option<LockRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT key, owner, expires_at FROM leader_lock WHERE key=?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((key, owner, millis)) => {
                let expires_at = Utc
                    .timestamp_millis_opt(millis)
                    .single()
                    .ok_or_else(|| SyncError::Store(format!("bad expires_at {}", millis)))?;
                Ok(Some(LockRecord {
                    key,
                    owner,
                    expires_at,
                }))
            }
            None => Ok(None),
        }
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

struct CacheRow {
    game_id: String,
    score_json: String,
    hash: String,
    starts_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl CacheRow {
    fn into_record(self) -> SyncResult<CacheRecord> {
        Ok(CacheRecord {
            game_id: self.game_id,
            score_json: serde_json::from_str(&self.score_json)?,
            hash: self.hash,
            starts_at: self.starts_at,
            updated_at: self.updated_at,
        })
    }
}

fn map_cache_row(row: &rusqlite::Row) -> rusqlite::Result<CacheRow> {
    Ok(CacheRow {
        game_id: row.get(0)?,
        score_json: row.get(1)?,
        hash: row.get(2)?,
        starts_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS game_cache (
    game_id     TEXT    PRIMARY KEY,
    score_json  TEXT    NOT NULL,
    hash        TEXT    NOT NULL,
    starts_at   TEXT,
    updated_at  TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS leader_lock (
    key         TEXT    PRIMARY KEY,
    owner       TEXT    NOT NULL,
    -- epoch milliseconds
    expires_at  INTEGER NOT NULL
);
"#;

//! In-memory doubles for the store and provider seams.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::db::models::{CacheRecord, LockRecord, RawRecord};
use crate::db::{CacheStore, LockStore};
use crate::error::{SyncError, SyncResult};
use crate::live_scores::ScoreProvider;

#[derive(Default)]
struct Tables {
    games: HashMap<String, CacheRecord>,
    locks: HashMap<String, LockRecord>,
    upserts: Vec<Vec<CacheRecord>>,
}

/// Cache + lock store that records every upsert batch.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_cache: AtomicBool,
    fail_lock: AtomicBool,
    renewals: AtomicUsize,
}

impl MemoryStore {
    pub fn fail_cache(&self, on: bool) {
        self.fail_cache.store(on, Ordering::SeqCst);
    }

    pub fn fail_lock(&self, on: bool) {
        self.fail_lock.store(on, Ordering::SeqCst);
    }

    /// Every non-empty `upsert_many` call, in order.
    pub fn upserts(&self) -> Vec<Vec<CacheRecord>> {
        self.tables.lock().unwrap().upserts.clone()
    }

    pub fn game(&self, id: &str) -> Option<CacheRecord> {
        self.tables.lock().unwrap().games.get(id).cloned()
    }

    pub fn lock_record(&self, key: &str) -> Option<LockRecord> {
        self.tables.lock().unwrap().locks.get(key).cloned()
    }

    /// Overwrite the lock record as another instance would.
    pub fn force_lock(&self, key: &str, owner: &str, expires_at: DateTime<Utc>) {
        self.tables.lock().unwrap().locks.insert(
            key.to_string(),
            LockRecord {
                key: key.to_string(),
                owner: owner.to_string(),
                expires_at,
            },
        );
    }

    pub fn lock_renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    fn check(flag: &AtomicBool) -> SyncResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(SyncError::Store("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn read_hashes(&self, ids: &[String]) -> SyncResult<HashMap<String, String>> {
        Self::check(&self.fail_cache)?;
        let tables = self.tables.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| tables.games.get(id).map(|r| (id.clone(), r.hash.clone())))
            .collect())
    }

    async fn upsert_many(&self, records: &[CacheRecord]) -> SyncResult<()> {
        Self::check(&self.fail_cache)?;
        if records.is_empty() {
            return Ok(());
        }
        let mut tables = self.tables.lock().unwrap();
        for rec in records {
            tables.games.insert(rec.game_id.clone(), rec.clone());
        }
        tables.upserts.push(records.to_vec());
        Ok(())
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_insert(
        &self,
        key: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> SyncResult<bool> {
        Self::check(&self.fail_lock)?;
        let mut tables = self.tables.lock().unwrap();
        if tables.locks.contains_key(key) {
            return Ok(false);
        }
        tables.locks.insert(
            key.to_string(),
            LockRecord {
                key: key.to_string(),
                owner: owner.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn try_steal_expired(
        &self,
        key: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SyncResult<bool> {
        Self::check(&self.fail_lock)?;
        let mut tables = self.tables.lock().unwrap();
        match tables.locks.get_mut(key) {
            Some(rec) if rec.is_expired(now) => {
                rec.owner = owner.to_string();
                rec.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew(
        &self,
        key: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> SyncResult<bool> {
        Self::check(&self.fail_lock)?;
        let mut tables = self.tables.lock().unwrap();
        match tables.locks.get_mut(key) {
            Some(rec) if rec.owner == owner => {
                rec.expires_at = expires_at;
                self.renewals.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, owner: &str) -> SyncResult<bool> {
        Self::check(&self.fail_lock)?;
        let mut tables = self.tables.lock().unwrap();
        if tables.locks.get(key).is_some_and(|r| r.owner == owner) {
            tables.locks.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn current(&self, key: &str) -> SyncResult<Option<LockRecord>> {
        Self::check(&self.fail_lock)?;
        Ok(self.tables.lock().unwrap().locks.get(key).cloned())
    }
}

/// Provider serving whatever batch (or failure) was last scripted.
pub struct ScriptedProvider {
    feed: Mutex<Result<Vec<RawRecord>, String>>,
    fail_next: AtomicUsize,
    hang: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(games: Vec<RawRecord>) -> Self {
        ScriptedProvider {
            feed: Mutex::new(Ok(games)),
            fail_next: AtomicUsize::new(0),
            hang: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_games(&self, games: Vec<RawRecord>) {
        *self.feed.lock().unwrap() = Ok(games);
    }

    /// Fail every call until `set_games` is called again.
    pub fn set_outage(&self, reason: &str) {
        *self.feed.lock().unwrap() = Err(reason.to_string());
    }

    /// Fail the next `n` calls, then serve the scripted feed again.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make every following call block forever, like a stalled connection.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScoreProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(&self) -> SyncResult<Vec<RawRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(SyncError::Upstream("HTTP 503 Service Unavailable".into()));
        }
        self.feed
            .lock()
            .unwrap()
            .clone()
            .map_err(SyncError::Upstream)
    }
}

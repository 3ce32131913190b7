//! Storage contracts consumed by the sync engine.
//!
//! The engine never talks to a concrete database directly: the cache table
//! and the lock table are reached through these two traits, so the SQLite
//! backend in [`crate::db::Database`] can be swapped for any store that
//! offers upsert-by-key and atomic conditional writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::models::{CacheRecord, LockRecord};
use crate::error::SyncResult;

/// Keyed score cache. Every effective write is what subscribers see.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Stored hashes for the given ids. Unknown ids are simply absent.
    async fn read_hashes(&self, ids: &[String]) -> SyncResult<HashMap<String, String>>;

    /// Insert or overwrite each record by `game_id`. Payload and hash of a
    /// record are written by a single statement.
    async fn upsert_many(&self, records: &[CacheRecord]) -> SyncResult<()>;
}

/// Shared `{key, owner, expires_at}` table backing the leader lock.
///
/// Each operation reports whether it affected a row; that boolean is the
/// whole coordination protocol.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Insert a new record for `key`; false if one already exists.
    async fn try_insert(
        &self,
        key: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> SyncResult<bool>;

    /// Take over `key` only if its current record expired before `now`.
    async fn try_steal_expired(
        &self,
        key: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SyncResult<bool>;

    /// Extend the expiry, conditioned on `key` and `owner` both matching.
    async fn renew(&self, key: &str, owner: &str, expires_at: DateTime<Utc>)
        -> SyncResult<bool>;

    /// Delete the record, conditioned on `owner` matching.
    async fn release(&self, key: &str, owner: &str) -> SyncResult<bool>;

    /// Current record for `key`, if any.
    async fn current(&self, key: &str) -> SyncResult<Option<LockRecord>>;
}

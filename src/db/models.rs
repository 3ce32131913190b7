use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque record exactly as returned by the upstream provider.
pub type RawRecord = serde_json::Value;

/// Canonical state of one game after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSnapshot {
    /// Stable game id, identical across polls for the same game
    pub id: String,
    /// Kickoff time, when the provider supplies a parseable one
    pub when: Option<DateTime<Utc>>,
    /// Teams, scores, status, kickoff. Hashed as content, never interpreted
    pub score_payload: serde_json::Value,
}

/// Persisted row of the `game_cache` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub game_id: String,
    pub score_json: serde_json::Value,
    /// Digest of `score_json`; always written together with it
    pub hash: String,
    pub starts_at: Option<DateTime<Utc>>,
    /// Time of the last effective write
    pub updated_at: DateTime<Utc>,
}

/// Persisted row of the `leader_lock` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub key: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

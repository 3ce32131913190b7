use async_trait::async_trait;

use crate::db::models::RawRecord;
use crate::error::SyncResult;

/// Trait that every upstream score source must implement.
///
/// Implementations do not retry; the sync loop owns retry and backoff.
#[async_trait]
pub trait ScoreProvider: Send + Sync {
    /// Return the provider's current list of raw game records.
    async fn fetch(&self) -> SyncResult<Vec<RawRecord>>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

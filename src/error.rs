use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised by the score sync engine.
///
/// Only `Config` and `LockLost` are allowed to end the process; the others
/// are caught at the tick boundary and the loop carries on.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Missing or invalid startup configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The upstream provider failed (transport, non-2xx, malformed body).
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Reading or writing the cache / lock tables failed.
    #[error("store error: {0}")]
    Store(String),

    /// The leader lock was lost and could not be reacquired.
    #[error("leader lock '{key}' lost by owner {owner}")]
    LockLost { key: String, owner: String },
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Upstream(format!("request timed out: {}", e))
        } else if e.is_decode() {
            SyncError::Upstream(format!("malformed body: {}", e))
        } else {
            SyncError::Upstream(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Store(format!("payload serialization failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_errors_map_to_store() {
        let err: SyncError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, SyncError::Store(_)));
    }
}

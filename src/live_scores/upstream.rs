use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::provider::ScoreProvider;
use crate::db::models::RawRecord;
use crate::error::{SyncError, SyncResult};

/// Envelope keys that commonly wrap the game list in provider responses.
const LIST_KEYS: [&str; 4] = ["games", "events", "data", "results"];

/// Provider backed by a single JSON endpoint polled over HTTP GET.
pub struct HttpScoreProvider {
    http: Client,
    url: String,
    token: Option<String>,
}

impl HttpScoreProvider {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> SyncResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(HttpScoreProvider {
            http,
            url: url.to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }
}

#[async_trait]
impl ScoreProvider for HttpScoreProvider {
    fn name(&self) -> &str {
        "http-upstream"
    }

    async fn fetch(&self) -> SyncResult<Vec<RawRecord>> {
        debug!("Fetching games from {}", self.url);

        let mut req = self.http.get(&self.url);
        if let Some(token) = &self.token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Upstream(format!(
                "HTTP {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        let raw: serde_json::Value = resp.json().await?;
        coerce_records(raw)
    }
}

/// Turn a response body into the list of raw game records it carries.
pub fn coerce_records(raw: serde_json::Value) -> SyncResult<Vec<RawRecord>> {
    match raw {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Object(mut obj) => {
            for key in LIST_KEYS {
                if matches!(obj.get(key), Some(serde_json::Value::Array(_))) {
                    if let Some(serde_json::Value::Array(items)) = obj.remove(key) {
                        return Ok(items);
                    }
                }
            }
            // A bare single-game object
            if obj.contains_key("id") || obj.contains_key("game_id") {
                return Ok(vec![serde_json::Value::Object(obj)]);
            }
            Err(SyncError::Upstream(
                "malformed body: object without a game list".into(),
            ))
        }
        other => Err(SyncError::Upstream(format!(
            "malformed body: expected array or object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

//! Content digests and the write/skip decision.
//!
//! A digest is SHA-256 over a canonical rendering of the payload: object keys
//! sorted at every level, no whitespace, leaves in serde_json's own
//! formatting. Two payloads that differ only in key order hash the same.
//!
//! `serde_json::Value` owns its children, so a payload cannot contain a
//! reference cycle. Nesting deeper than [`MAX_DIGEST_DEPTH`] is rendered as a
//! terminal marker instead of being walked.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::db::models::{CacheRecord, GameSnapshot};

pub const MAX_DIGEST_DEPTH: usize = 128;

/// Not a valid JSON token, so it cannot collide with real content.
const DEPTH_MARKER: char = '#';

/// Lowercase hex SHA-256 of the canonical form of `payload`.
pub fn digest(payload: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(payload, 0, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, depth: usize, out: &mut String) {
    if depth > MAX_DIGEST_DEPTH {
        out.push(DEPTH_MARKER);
        return;
    }
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, depth + 1, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], depth + 1, out);
            }
            out.push('}');
        }
        // null, bool, number, string
        leaf => out.push_str(&leaf.to_string()),
    }
}

/// Outcome of comparing one batch against the stored hashes.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// Records to upsert, in batch order
    pub records: Vec<CacheRecord>,
    /// Games seen for the first time
    pub created: usize,
    /// Games whose payload changed
    pub updated: usize,
    /// Games skipped because their hash matched
    pub unchanged: usize,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Keep only snapshots whose digest is new or differs from `prior`.
///
/// `prior` must be read for the whole batch before this runs, so every
/// decision is made against the same view of the cache.
pub fn detect_changes(
    snapshots: Vec<GameSnapshot>,
    prior: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> ChangeSet {
    let mut set = ChangeSet::default();
    for snap in snapshots {
        let hash = digest(&snap.score_payload);
        match prior.get(&snap.id) {
            Some(old) if *old == hash => {
                set.unchanged += 1;
                continue;
            }
            Some(_) => set.updated += 1,
            None => set.created += 1,
        }
        set.records.push(CacheRecord {
            game_id: snap.id,
            score_json: snap.score_payload,
            hash,
            starts_at: snap.when,
            updated_at: now,
        });
    }
    set
}

//! Provider records → canonical [`GameSnapshot`]s.
//!
//! Normalization is a pure function of its input: the same raw batch always
//! yields the same snapshots in the same order, which is what keeps content
//! hashes stable from one poll to the next. A record is only dropped when it
//! has no usable identifier; every other gap becomes `null` in the payload.
//!
//! Two record shapes are understood:
//! - **competitor shape**: `competitions[0].competitors[]`, each tagged with
//!   `homeAway`, the layout used by scoreboard-style feeds
//! - **flat shape**: `home_team` / `home_points` style fields on the record
//!   itself, with a handful of common spellings

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::db::models::{GameSnapshot, RawRecord};

const ID_KEYS: [&str; 5] = ["id", "game_id", "gameId", "event_id", "idEvent"];
const KICKOFF_KEYS: [&str; 6] = ["start_date", "startDate", "kickoff", "date", "when", "dateEvent"];

const HOME_TEAM_KEYS: [&str; 3] = ["home_team", "homeTeam", "strHomeTeam"];
const AWAY_TEAM_KEYS: [&str; 3] = ["away_team", "awayTeam", "strAwayTeam"];
const HOME_SCORE_KEYS: [&str; 5] = [
    "home_points",
    "home_score",
    "homeScore",
    "homePoints",
    "intHomeScore",
];
const AWAY_SCORE_KEYS: [&str; 5] = [
    "away_points",
    "away_score",
    "awayScore",
    "awayPoints",
    "intAwayScore",
];
const STATUS_KEYS: [&str; 2] = ["status", "strStatus"];
const PERIOD_KEYS: [&str; 2] = ["period", "quarter"];
const VENUE_KEYS: [&str; 2] = ["venue", "strVenue"];

/// Normalize one fetched batch.
///
/// Duplicate ids within a batch are a provider/normalizer defect: the last
/// record seen wins, keeps the slot of the first occurrence, and is logged.
pub fn normalize(raw: &[RawRecord]) -> Vec<GameSnapshot> {
    let mut out: Vec<GameSnapshot> = Vec::with_capacity(raw.len());
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(raw.len());

    for record in raw {
        let Some(snapshot) = normalize_record(record) else {
            debug!("Dropping record without a game id");
            continue;
        };
        match slots.get(&snapshot.id) {
            Some(&slot) => {
                warn!(game_id = %snapshot.id, "Duplicate game id in batch, last record wins");
                out[slot] = snapshot;
            }
            None => {
                slots.insert(snapshot.id.clone(), out.len());
                out.push(snapshot);
            }
        }
    }

    out
}

/// Normalize a single record; `None` only when it carries no usable id.
pub fn normalize_record(record: &RawRecord) -> Option<GameSnapshot> {
    let obj = record.as_object()?;
    let id = ID_KEYS.iter().find_map(|k| obj.get(*k).and_then(id_from_value))?;
    let when = KICKOFF_KEYS
        .iter()
        .find_map(|k| obj.get(*k).and_then(parse_kickoff));

    let mut score_payload = match obj
        .get("competitions")
        .and_then(|c| c.get(0))
        .and_then(Value::as_object)
    {
        Some(competition) => competitor_payload(obj, competition),
        None => flat_payload(obj),
    };
    // Hashed with the rest so a rescheduled kickoff counts as a change
    if let Some(fields) = score_payload.as_object_mut() {
        let kickoff = when
            .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::Secs, true)))
            .unwrap_or(Value::Null);
        fields.insert("when".to_string(), kickoff);
    }

    Some(GameSnapshot {
        id,
        when,
        score_payload,
    })
}

fn id_from_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

/// Parse RFC 3339, a zone-less date-time (taken as UTC) or a bare date.
pub fn parse_kickoff(v: &Value) -> Option<DateTime<Utc>> {
    let s = v.as_str()?.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%MZ",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

// ── Competitor shape ─────────────────────────────────────────────────────────

fn competitor_payload(record: &Map<String, Value>, competition: &Map<String, Value>) -> Value {
    let mut home = side(Value::Null, Value::Null);
    let mut away = side(Value::Null, Value::Null);

    let competitors = competition
        .get("competitors")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for competitor in competitors {
        let team = competitor
            .get("team")
            .map(competitor_team_name)
            .unwrap_or(Value::Null);
        let score = competitor.get("score").map(parse_score).unwrap_or(Value::Null);
        match competitor.get("homeAway").and_then(Value::as_str) {
            Some("home") => home = side(team, score),
            Some("away") => away = side(team, score),
            _ => {}
        }
    }

    let status_obj = competition.get("status");
    let status = status_obj
        .and_then(|s| s.get("type"))
        .and_then(|t| t.get("name").or_else(|| t.get("description")))
        .and_then(Value::as_str)
        .map(|s| Value::String(s.to_string()))
        .unwrap_or_else(|| first_text(record, &STATUS_KEYS));
    let period = status_obj
        .and_then(|s| s.get("period"))
        .map(parse_score)
        .unwrap_or(Value::Null);
    let clock = status_obj
        .and_then(|s| s.get("displayClock"))
        .and_then(Value::as_str)
        .map(|s| Value::String(s.to_string()))
        .unwrap_or(Value::Null);
    let venue = competition
        .get("venue")
        .and_then(|v| v.get("fullName"))
        .and_then(Value::as_str)
        .map(|s| Value::String(s.to_string()))
        .unwrap_or(Value::Null);

    payload(home, away, status, period, clock, venue)
}

fn competitor_team_name(team: &Value) -> Value {
    if let Some(s) = team.as_str() {
        return Value::String(s.to_string());
    }
    ["displayName", "name", "location"]
        .iter()
        .find_map(|k| team.get(*k).and_then(Value::as_str))
        .map(|s| Value::String(s.to_string()))
        .unwrap_or(Value::Null)
}

// ── Flat shape ───────────────────────────────────────────────────────────────

fn flat_payload(record: &Map<String, Value>) -> Value {
    let home = side(
        first_text(record, &HOME_TEAM_KEYS),
        first_score(record, &HOME_SCORE_KEYS),
    );
    let away = side(
        first_text(record, &AWAY_TEAM_KEYS),
        first_score(record, &AWAY_SCORE_KEYS),
    );
    payload(
        home,
        away,
        first_text(record, &STATUS_KEYS),
        first_score(record, &PERIOD_KEYS),
        first_text(record, &["clock"]),
        first_text(record, &VENUE_KEYS),
    )
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn side(team: Value, score: Value) -> Value {
    json!({ "team": team, "score": score })
}

fn payload(home: Value, away: Value, status: Value, period: Value, clock: Value, venue: Value) -> Value {
    json!({
        "home": home,
        "away": away,
        "status": status,
        "period": period,
        "clock": clock,
        "venue": venue,
    })
}

/// First non-null value among `keys`, rendered as text.
fn first_text(record: &Map<String, Value>, keys: &[&str]) -> Value {
    keys.iter()
        .filter_map(|k| record.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(Value::String(s.trim().to_string())),
            Value::Number(n) => Some(Value::String(n.to_string())),
            // e.g. `"venue": {"name": ...}`
            Value::Object(o) => ["name", "fullName", "description"]
                .iter()
                .find_map(|k| o.get(*k).and_then(Value::as_str))
                .map(|s| Value::String(s.to_string())),
            _ => None,
        })
        .unwrap_or(Value::Null)
}

fn first_score(record: &Map<String, Value>, keys: &[&str]) -> Value {
    keys.iter()
        .filter_map(|k| record.get(*k))
        .map(parse_score)
        .find(|v| !v.is_null())
        .unwrap_or(Value::Null)
}

/// Coerce a score-like value to an integer, `null` when it is not one.
///
/// Integral floats collapse to integers so `10` and `10.0` hash alike.
pub fn parse_score(v: &Value) -> Value {
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Value::from(f as i64),
                    _ => Value::Null,
                }
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| s.trim().parse::<f64>().map(|f| parse_score(&json!(f))))
            .unwrap_or(Value::Null),
        Value::Object(o) => o
            .get("value")
            .or_else(|| o.get("displayValue"))
            .map(parse_score)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

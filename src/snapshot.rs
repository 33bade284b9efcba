//! Snapshot encoding for store persistence
//!
//! A snapshot is a JSON object keyed by entry key:
//!
//! ```text
//! {
//!   "<key>": { "value": 42, "hasExpiry": true, "ttl_remaining": 30 },
//!   "<key>": { "value": "text", "hasExpiry": false, "ttl_remaining": null }
//! }
//! ```
//!
//! Deadlines are stored as seconds remaining at dump time and rebased onto the
//! clock at load time, so a snapshot stays meaningful across restarts.

use crate::error::{MiniKvError, Result};
use crate::store::{deadline_after, Entry, EntryMap};
use crate::value::Value;
use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

#[derive(Serialize)]
struct RecordRef<'a> {
    value: &'a Value,
    #[serde(rename = "hasExpiry")]
    has_expiry: bool,
    ttl_remaining: Option<i64>,
}

#[derive(Deserialize)]
struct Record {
    value: Value,
    #[serde(rename = "hasExpiry", default)]
    has_expiry: bool,
    #[serde(default)]
    ttl_remaining: Option<i64>,
}

/// Encode every entry still live at `now`
pub(crate) fn encode(entries: &EntryMap, now: Instant) -> Result<Vec<u8>> {
    let mut records = BTreeMap::new();

    for (key, entry) in entries {
        if entry.is_expired_at(now) {
            continue;
        }
        if let Value::Float(x) = entry.value {
            if !x.is_finite() {
                return Err(MiniKvError::Encode(format!(
                    "key '{}' holds {}, which JSON cannot represent",
                    key, x
                )));
            }
        }

        let ttl_remaining = entry.expires_at.map(|deadline| remaining_secs(deadline, now));
        records.insert(
            key.as_str(),
            RecordRef {
                value: &entry.value,
                has_expiry: ttl_remaining.is_some(),
                ttl_remaining,
            },
        );
    }

    serde_json::to_vec_pretty(&records).map_err(|e| MiniKvError::Encode(e.to_string()))
}

/// Decode a snapshot, rebasing deadlines onto `now`
///
/// Nothing is returned unless every record decodes.
pub(crate) fn decode(bytes: &[u8], now: Instant) -> Result<EntryMap> {
    let records: HashMap<String, Record> = serde_json::from_slice(bytes)?;

    records
        .into_iter()
        .map(|(key, record)| -> Result<(String, Entry)> {
            let expires_at = match (record.has_expiry, record.ttl_remaining) {
                (false, None) => None,
                (true, Some(ttl)) => Some(deadline_after(now, ttl)),
                (true, None) => {
                    return Err(serde_json::Error::custom(format!(
                        "key '{}' has an expiry but no ttl_remaining",
                        key
                    ))
                    .into())
                }
                (false, Some(_)) => {
                    return Err(serde_json::Error::custom(format!(
                        "key '{}' has a ttl_remaining but no expiry",
                        key
                    ))
                    .into())
                }
            };
            Ok((
                key,
                Entry {
                    value: record.value,
                    expires_at,
                },
            ))
        })
        .collect()
}

/// Whole seconds until `deadline`, rounded up so a live entry never records 0
fn remaining_secs(deadline: Instant, now: Instant) -> i64 {
    let left = deadline.saturating_duration_since(now);
    let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entries(list: Vec<(&str, Entry)>) -> EntryMap {
        list.into_iter().map(|(k, e)| (k.to_string(), e)).collect()
    }

    #[test]
    fn test_encode_format() {
        let now = Instant::now();
        let map = entries(vec![
            ("plain", Entry::new(Value::Int(42))),
            ("timed", Entry::with_ttl(Value::from("soon"), 30, now)),
        ]);

        let json: serde_json::Value = serde_json::from_slice(&encode(&map, now).unwrap()).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "plain": { "value": 42, "hasExpiry": false, "ttl_remaining": null },
                "timed": { "value": "soon", "hasExpiry": true, "ttl_remaining": 30 },
            })
        );
    }

    #[test]
    fn test_encode_skips_expired_entries() {
        let now = Instant::now();
        let map = entries(vec![
            ("live", Entry::new(Value::Bool(true))),
            ("dead", Entry::with_ttl(Value::Bool(false), 0, now)),
        ]);

        let json: serde_json::Value = serde_json::from_slice(&encode(&map, now).unwrap()).unwrap();
        let object = json.as_object().unwrap();
        assert!(object.contains_key("live"));
        assert!(!object.contains_key("dead"));
    }

    #[test]
    fn test_encode_rejects_non_finite_float() {
        let map = entries(vec![("nan", Entry::new(Value::Float(f64::NAN)))]);
        assert!(matches!(encode(&map, Instant::now()), Err(MiniKvError::Encode(_))));
    }

    #[test]
    fn test_remaining_secs_rounds_up() {
        let now = Instant::now();
        assert_eq!(remaining_secs(now + Duration::from_millis(1), now), 1);
        assert_eq!(remaining_secs(now + Duration::from_secs(5), now), 5);
        assert_eq!(remaining_secs(now + Duration::from_millis(5001), now), 6);
    }

    #[test]
    fn test_decode_rebases_deadlines() {
        let input = br#"{
            "a": { "value": 1.5, "hasExpiry": true, "ttl_remaining": 10 },
            "b": { "value": "text", "hasExpiry": false, "ttl_remaining": null },
            "c": { "value": false }
        }"#;
        let now = Instant::now();
        let map = decode(input, now).unwrap();

        assert_eq!(map["a"].value, Value::Float(1.5));
        assert_eq!(map["a"].expires_at, Some(now + Duration::from_secs(10)));
        assert_eq!(map["b"], Entry::new(Value::from("text")));
        assert_eq!(map["c"], Entry::new(Value::Bool(false)));
    }

    #[test]
    fn test_decode_non_positive_ttl_is_expired() {
        let input = br#"{
            "zero": { "value": 1, "hasExpiry": true, "ttl_remaining": 0 },
            "negative": { "value": 2, "hasExpiry": true, "ttl_remaining": -3 }
        }"#;
        let now = Instant::now();
        let map = decode(input, now).unwrap();

        assert!(map["zero"].is_expired_at(now));
        assert!(map["negative"].is_expired_at(now));
    }

    #[test]
    fn test_decode_errors() {
        let now = Instant::now();
        let cases: [&[u8]; 6] = [
            b"[]",
            b"{\"k\": {\"hasExpiry\": false}}",
            b"{\"k\": {\"value\": [1]}}",
            b"{\"k\": {\"value\": 1, \"hasExpiry\": true, \"ttl_remaining\": null}}",
            b"{\"k\": {\"value\": 1, \"hasExpiry\": false, \"ttl_remaining\": 5}}",
            b"{\"k\": {\"value\": 1, \"ttl_remaining\": \"soon\"}}",
        ];

        for case in cases {
            assert!(
                matches!(decode(case, now), Err(MiniKvError::Decode(_))),
                "expected decode error for {}",
                String::from_utf8_lossy(case)
            );
        }
    }
}

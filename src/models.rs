use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One ingested message from the source channel. Immutable once merged into
/// the store; the source message id is the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    /// Raw text content. May be empty, never absent.
    pub text: String,
    #[serde(default)]
    pub meta: SourceMeta,
}

/// Source metadata carried through unmodified. The core never interprets
/// these fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub views: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwards: Option<i64>,
    /// Anything else the source attached, passed through verbatim.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

/// Cached summary for one day key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub day_key: String,
    pub text: String,
    #[serde(default)]
    pub key_topics: Vec<String>,
    /// Item count the summary was built from, captured at generation time.
    pub source_item_count: usize,
    pub generated_at: DateTime<Utc>,
    /// True when the live item count for `day_key` no longer matches
    /// `source_item_count`. Derived at read time, never persisted.
    #[serde(default)]
    pub stale: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_items: usize,
    pub latest_timestamp: Option<DateTime<Utc>>,
    pub per_day_counts: BTreeMap<String, usize>,
}

/// Derives the day key for an instant: convert to the configured zone
/// (DST-aware), take the date component.
pub fn day_key_for(timestamp: DateTime<Utc>, tz: Tz) -> String {
    timestamp.with_timezone(&tz).format("%Y-%m-%d").to_string()
}

pub fn parse_day_key(day_key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(day_key, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_day_key_timezone_bucketing() {
        // Late-evening UTC rolls into the next day in Moscow (UTC+3).
        let ts = Utc.with_ymd_and_hms(2025, 9, 20, 23, 30, 0).unwrap();
        assert_eq!(day_key_for(ts, chrono_tz::Europe::Moscow), "2025-09-21");
        assert_eq!(day_key_for(ts, chrono_tz::UTC), "2025-09-20");
    }

    #[test]
    fn test_day_key_dst_boundary() {
        // New York is UTC-4 during DST: 03:00 UTC is still the previous day.
        let ts = Utc.with_ymd_and_hms(2025, 7, 1, 3, 0, 0).unwrap();
        assert_eq!(day_key_for(ts, chrono_tz::America::New_York), "2025-06-30");
        // Same wall-clock offset check in winter (UTC-5).
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 4, 30, 0).unwrap();
        assert_eq!(day_key_for(ts, chrono_tz::America::New_York), "2024-12-31");
    }

    #[test]
    fn test_parse_day_key() {
        assert!(parse_day_key("2025-09-20").is_some());
        assert!(parse_day_key("2025-13-01").is_none());
        assert!(parse_day_key("today").is_none());
        assert!(parse_day_key("").is_none());
    }

    #[test]
    fn test_source_meta_roundtrip() {
        let meta = SourceMeta {
            views: Some(10),
            forwards: None,
            extra: serde_json::json!({"sender": "channel", "has_media": true}),
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: SourceMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
        // forwards is None and must not appear on the wire.
        assert!(!json.contains("forwards"));
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::DaybriefError;
use crate::models::{Item, SourceMeta};

/// Result of one fetch attempt. A mid-stream failure still yields the items
/// obtained so far; the error travels alongside the partial batch instead of
/// replacing it, so the caller can merge the prefix and report the failure
/// separately.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub items: Vec<Item>,
    pub error: Option<DaybriefError>,
}

/// Boundary to the message source. Implementations normalize whatever the
/// source returns into `Item`s and never panic or propagate transport errors
/// past this trait.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Items newer than `watermark`, oldest first, at most `limit`.
    async fn fetch_since(&self, watermark: DateTime<Utc>, limit: usize) -> FetchOutcome;
}

/// Thin adapter over an HTTP feed endpoint serving the source channel's
/// messages as JSON: `{"items": [{"message_id", "date", "text", ...}]}`.
pub struct HttpFetcher {
    client: reqwest::Client,
    feed_url: String,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            feed_url: config.source_feed_url.clone(),
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_since(&self, watermark: DateTime<Utc>, limit: usize) -> FetchOutcome {
        debug!("Fetching feed since {} (limit {})", watermark, limit);
        let response = self
            .client
            .get(&self.feed_url)
            .query(&[
                ("since", watermark.to_rfc3339()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status());

        let body = match response {
            Ok(r) => match r.json::<serde_json::Value>().await {
                Ok(v) => v,
                Err(e) => {
                    return FetchOutcome {
                        items: vec![],
                        error: Some(DaybriefError::Fetch(format!("invalid feed body: {}", e))),
                    }
                }
            },
            Err(e) => {
                return FetchOutcome {
                    items: vec![],
                    error: Some(DaybriefError::Fetch(e.to_string())),
                }
            }
        };

        parse_feed(&body)
    }
}

#[derive(Deserialize)]
struct FeedItem {
    message_id: i64,
    date: DateTime<Utc>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    views: Option<i64>,
    #[serde(default)]
    forwards: Option<i64>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl From<FeedItem> for Item {
    fn from(f: FeedItem) -> Self {
        let extra = if f.extra.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::Value::Object(f.extra)
        };
        Item {
            id: f.message_id,
            timestamp: f.date,
            text: f.text,
            meta: SourceMeta {
                views: f.views,
                forwards: f.forwards,
                extra,
            },
        }
    }
}

/// Decodes the feed entry by entry. A malformed entry ends the batch at that
/// point: the valid prefix is returned together with a fetch error, matching
/// the partial-failure contract.
fn parse_feed(body: &serde_json::Value) -> FetchOutcome {
    let Some(raw_items) = body.get("items").and_then(|v| v.as_array()) else {
        return FetchOutcome {
            items: vec![],
            error: Some(DaybriefError::Fetch("feed body missing items array".into())),
        };
    };

    let mut items = Vec::with_capacity(raw_items.len());
    for (idx, raw) in raw_items.iter().enumerate() {
        match serde_json::from_value::<FeedItem>(raw.clone()) {
            Ok(f) => items.push(Item::from(f)),
            Err(e) => {
                warn!("Feed entry {} malformed, keeping {} earlier items: {}", idx, items.len(), e);
                return FetchOutcome {
                    items,
                    error: Some(DaybriefError::Fetch(format!("feed entry {}: {}", idx, e))),
                };
            }
        }
    }
    FetchOutcome { items, error: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_feed_full_batch() {
        let body = json!({"items": [
            {"message_id": 1, "date": "2025-09-20T10:00:00Z", "text": "first", "views": 5},
            {"message_id": 2, "date": "2025-09-20T11:00:00Z", "text": "second", "sender": "ch"},
        ]});

        let outcome = parse_feed(&body);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.items.len(), 2);
        assert_eq!(outcome.items[0].id, 1);
        assert_eq!(outcome.items[0].meta.views, Some(5));
        // Unrecognized fields ride along in the opaque bag.
        assert_eq!(outcome.items[1].meta.extra["sender"], "ch");
    }

    #[test]
    fn test_parse_feed_partial_on_malformed_entry() {
        let body = json!({"items": [
            {"message_id": 1, "date": "2025-09-20T10:00:00Z", "text": "ok"},
            {"message_id": "not-a-number", "date": "2025-09-20T11:00:00Z"},
            {"message_id": 3, "date": "2025-09-20T12:00:00Z", "text": "never reached"},
        ]});

        let outcome = parse_feed(&body);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].id, 1);
        assert!(matches!(outcome.error, Some(DaybriefError::Fetch(_))));
    }

    #[test]
    fn test_parse_feed_missing_items() {
        let outcome = parse_feed(&json!({"unexpected": true}));
        assert!(outcome.items.is_empty());
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_empty_text_is_kept() {
        let body = json!({"items": [
            {"message_id": 1, "date": "2025-09-20T10:00:00Z"},
        ]});
        let outcome = parse_feed(&body);
        assert_eq!(outcome.items[0].text, "");
    }
}

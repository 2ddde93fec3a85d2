use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{DaybriefError, Result};
use crate::fetch::Fetcher;
use crate::models::{day_key_for, parse_day_key, Artifact, Item, StoreStats};
use crate::store::Store;
use crate::summarizer::Summarizer;

/// Text of the artifact stored when a day has no summarizable content. The
/// external summarizer is never called for such days.
pub const NO_NEWS_TEXT: &str = "No news items were recorded for this day.";

/// Orchestrates the pipeline around the store: ingest (fetch → merge), the
/// cache-hit/regenerate decision, and the query surface used by callers and
/// the scheduler.
pub struct DigestService {
    store: Store,
    summarizer: Arc<dyn Summarizer>,
    fetcher: Arc<dyn Fetcher>,
    tz: Tz,
    fetch_limit: usize,
    backfill_days: i64,
    /// One lock per day key: at most one in-flight generation per day.
    /// Grows by one entry per distinct day ever requested, which is bounded.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DigestService {
    pub fn new(
        store: Store,
        summarizer: Arc<dyn Summarizer>,
        fetcher: Arc<dyn Fetcher>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            summarizer,
            fetcher,
            tz: config.scheduler_timezone,
            fetch_limit: config.fetch_limit,
            backfill_days: config.backfill_days,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn today_key(&self) -> String {
        day_key_for(Utc::now(), self.tz)
    }

    /// Fetches everything newer than the store watermark and merges it.
    /// A fetch failure mid-stream still merges the partial batch; the error
    /// comes back alongside the new-item count as a job-level warning signal.
    pub async fn ingest_latest(&self) -> Result<(usize, Option<DaybriefError>)> {
        let store = self.store.clone();
        let watermark = tokio::task::spawn_blocking(move || store.latest_timestamp())
            .await??
            .unwrap_or_else(|| Utc::now() - Duration::days(self.backfill_days));

        let outcome = self.fetcher.fetch_since(watermark, self.fetch_limit).await;
        if let Some(err) = &outcome.error {
            warn!("Fetch returned an error, merging {} partial items: {}", outcome.items.len(), err);
        }

        let items = outcome.items;
        let store = self.store.clone();
        let new_count = tokio::task::spawn_blocking(move || store.merge_items(&items)).await??;
        info!("Ingest merged {} new items", new_count);
        Ok((new_count, outcome.error))
    }

    /// Read-only cache lookup. Never triggers generation; a stale artifact
    /// is returned flagged, not hidden.
    pub async fn get_summary(&self, day_key: &str) -> Result<Option<Artifact>> {
        let day_key = valid_day_key(day_key)?;
        self.read_cached(day_key).await
    }

    /// Cache-or-generate. With `force` the cache is bypassed and the day is
    /// regenerated; without it any cached artifact (stale included) is a hit
    /// and only a miss falls through to generation.
    pub async fn request_summary(&self, day_key: &str, force: bool) -> Result<Artifact> {
        let day_key = valid_day_key(day_key)?;
        if !force {
            if let Some(artifact) = self.read_cached(day_key).await? {
                return Ok(artifact);
            }
        }
        self.regenerate(day_key, force).await
    }

    pub async fn get_stats(&self) -> Result<StoreStats> {
        let store = self.store.clone();
        let tz = self.tz;
        tokio::task::spawn_blocking(move || store.stats(tz)).await?
    }

    /// Clears items and summaries together; the cache never outlives the
    /// items it was built from.
    pub async fn clear_all(&self) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.clear_all()).await?
    }

    /// Invalidates one cached artifact. Returns whether one existed.
    pub async fn clear_summary(&self, day_key: &str) -> Result<bool> {
        let day_key = valid_day_key(day_key)?.to_string();
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.clear_summary(&day_key)).await?
    }

    async fn regenerate(&self, day_key: &str, force: bool) -> Result<Artifact> {
        let wait_started = generation_instant();
        let lock = self.day_lock(day_key).await;
        let _guard = lock.lock().await;

        // Wait-and-reuse: another caller may have finished a generation
        // while we waited for the key lock.
        if let Some(artifact) = self.read_cached(day_key).await? {
            if reusable_after_wait(&artifact, force, wait_started) {
                return Ok(artifact);
            }
        }

        let store = self.store.clone();
        let tz = self.tz;
        let key = day_key.to_string();
        let (items, count) =
            tokio::task::spawn_blocking(move || store.day_snapshot(&key, tz)).await??;

        let payload = assemble_payload(&items);
        if payload.is_empty() {
            let artifact = Artifact {
                day_key: day_key.to_string(),
                text: NO_NEWS_TEXT.to_string(),
                key_topics: vec![],
                source_item_count: count,
                generated_at: generation_instant(),
                stale: false,
            };
            self.put(artifact.clone()).await?;
            info!("No content for {}, stored no-news artifact", day_key);
            return Ok(artifact);
        }

        // A summarizer failure propagates without touching the cache, so any
        // prior valid artifact survives the failed attempt.
        let output = self.summarizer.summarize(&payload, day_key).await?;

        let artifact = Artifact {
            day_key: day_key.to_string(),
            text: output.text,
            key_topics: output.key_topics,
            source_item_count: count,
            generated_at: generation_instant(),
            stale: false,
        };
        self.put(artifact.clone()).await?;
        info!("Stored regenerated summary for {} ({} items)", day_key, count);
        Ok(artifact)
    }

    async fn read_cached(&self, day_key: &str) -> Result<Option<Artifact>> {
        let store = self.store.clone();
        let tz = self.tz;
        let key = day_key.to_string();
        tokio::task::spawn_blocking(move || store.get_summary(&key, tz)).await?
    }

    async fn put(&self, artifact: Artifact) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.put_summary(&artifact)).await?
    }

    async fn day_lock(&self, day_key: &str) -> Arc<Mutex<()>> {
        let mut map = self.inflight.lock().await;
        map.entry(day_key.to_string()).or_default().clone()
    }
}

/// Generation instants are persisted at millisecond precision; truncating
/// here keeps the returned artifact identical to what a later read sees.
fn generation_instant() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// A forced request only reuses a result produced after it started waiting;
/// a fallthrough from a cache miss reuses whatever is there now. Both
/// instants carry millisecond precision, so a generation that completes in
/// the same millisecond the waiter arrived still counts as reusable.
fn reusable_after_wait(artifact: &Artifact, force: bool, wait_started: DateTime<Utc>) -> bool {
    !force || artifact.generated_at >= wait_started
}

fn valid_day_key(day_key: &str) -> Result<&str> {
    match parse_day_key(day_key) {
        Some(_) => Ok(day_key),
        None => Err(DaybriefError::InvalidDayKey(day_key.to_string())),
    }
}

/// One bullet per item, blank texts skipped. An empty result means there is
/// nothing worth sending to the summarizer.
fn assemble_payload(items: &[Item]) -> String {
    let mut out = String::new();
    for item in items {
        let text = item.text.trim();
        if text.is_empty() {
            continue;
        }
        out.push_str("- ");
        out.push_str(text);
        out.push('\n');
    }
    out.trim_end().to_string()
}

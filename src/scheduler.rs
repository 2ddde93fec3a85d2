use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::deliver::Deliver;
use crate::digest::DigestService;
use crate::error::{DaybriefError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Job {
    Dump,
    Push,
}

impl Job {
    fn name(self) -> &'static str {
        match self {
            Job::Dump => "dump",
            Job::Push => "push",
        }
    }
}

/// Two fixed daily triggers in the configured timezone: `dump` ingests and
/// regenerates today's summary, `push` runs a small offset later and hands
/// the artifact to the distribution collaborator. Each job self-excludes:
/// a fire that lands while the previous run of the same job is still going
/// is skipped.
pub struct DailyScheduler {
    digest: Arc<DigestService>,
    delivery: Option<Arc<dyn Deliver>>,
    tz: Tz,
    dump_at: NaiveTime,
    push_at: NaiveTime,
    dump_running: Mutex<()>,
    push_running: Mutex<()>,
}

impl DailyScheduler {
    pub fn new(
        digest: Arc<DigestService>,
        delivery: Option<Arc<dyn Deliver>>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let dump_at = NaiveTime::from_hms_opt(config.dump_hour, config.dump_minute, 0)
            .ok_or_else(|| anyhow::anyhow!("invalid dump time"))?;
        let push_at = shift_minutes(dump_at, config.push_offset_minutes);
        Ok(Self {
            digest,
            delivery,
            tz: config.scheduler_timezone,
            dump_at,
            push_at,
            dump_running: Mutex::new(()),
            push_running: Mutex::new(()),
        })
    }

    /// Spawns one timer loop per job and returns their handles. A loop
    /// stops after the shutdown signal flips, but never interrupts a job
    /// body: an in-flight invocation finishes or fails on its own.
    pub fn start(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        info!(
            "Scheduler started: dump at {} {}, push at {} {}",
            self.dump_at, self.tz, self.push_at, self.tz
        );
        vec![
            tokio::spawn(self.clone().job_loop(Job::Dump, shutdown.clone())),
            tokio::spawn(self.job_loop(Job::Push, shutdown)),
        ]
    }

    async fn job_loop(self: Arc<Self>, job: Job, mut shutdown: watch::Receiver<bool>) {
        loop {
            let at = match job {
                Job::Dump => self.dump_at,
                Job::Push => self.push_at,
            };
            let now = Utc::now();
            let fire = next_fire(now, self.tz, at);
            info!(
                "Job '{}' next fire at {}",
                job.name(),
                fire.with_timezone(&self.tz)
            );
            let wait = (fire - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => self.fire(job).await,
                _ = shutdown.changed() => {
                    info!("Job '{}' loop stopping", job.name());
                    return;
                }
            }
        }
    }

    async fn fire(&self, job: Job) {
        let lock = match job {
            Job::Dump => &self.dump_running,
            Job::Push => &self.push_running,
        };
        // Self-exclusion: never run two invocations of the same job at once.
        let Ok(_guard) = lock.try_lock() else {
            warn!("Job '{}' still running from a previous fire, skipping", job.name());
            return;
        };

        let result = match job {
            Job::Dump => self.run_dump().await,
            Job::Push => self.run_push().await,
        };
        match result {
            Ok(()) => info!("Job '{}' completed", job.name()),
            // The next regular fire is the retry; no crash, no tight loop.
            Err(e) => error!("Job '{}' failed: {}", job.name(), e),
        }
    }

    /// Fetch, merge, regenerate today's artifact. A partial fetch is a
    /// warning, not an abort; a generation failure leaves the prior artifact
    /// in place for the push job to use.
    async fn run_dump(&self) -> Result<()> {
        let (new_count, fetch_error) = self.digest.ingest_latest().await?;
        if let Some(e) = fetch_error {
            warn!("Dump fetched a partial batch: {}", e);
        }
        info!("Dump merged {} new items", new_count);

        let today = self.digest.today_key();
        match self.digest.request_summary(&today, true).await {
            Ok(artifact) => {
                info!(
                    "Dump regenerated summary for {} from {} items",
                    today, artifact.source_item_count
                );
                Ok(())
            }
            Err(DaybriefError::Generation(e)) => {
                warn!("Dump could not regenerate summary for {}: {}", today, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Ingest any stragglers, make sure today's artifact is current, then
    /// deliver it. A generation failure skips delivery for this run rather
    /// than pushing stale or missing content.
    async fn run_push(&self) -> Result<()> {
        let (_, fetch_error) = self.digest.ingest_latest().await?;
        if let Some(e) = fetch_error {
            warn!("Push fetched a partial batch: {}", e);
        }

        let today = self.digest.today_key();
        let artifact = match self.digest.get_summary(&today).await? {
            Some(artifact) if !artifact.stale => artifact,
            _ => match self.digest.request_summary(&today, true).await {
                Ok(artifact) => artifact,
                Err(DaybriefError::Generation(e)) => {
                    warn!("No deliverable summary for {}, skipping push: {}", today, e);
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
        };

        let Some(delivery) = &self.delivery else {
            info!("No delivery endpoint configured, summary for {} stays cached", today);
            return Ok(());
        };
        if let Err(e) = delivery.deliver(&artifact).await {
            // The artifact stays stored; only this run's distribution is lost.
            error!("Delivery failed for {}: {}", today, e);
        }
        Ok(())
    }
}

fn shift_minutes(at: NaiveTime, minutes: u32) -> NaiveTime {
    at.overflowing_add_signed(Duration::minutes(minutes as i64)).0
}

/// Next instant strictly after `after` at which the wall clock in `tz`
/// reads `at`. Fully DST-aware: a time skipped by a spring-forward gap
/// resolves to the earliest following representable instant, an ambiguous
/// fall-back time to its earlier occurrence.
fn next_fire(after: DateTime<Utc>, tz: Tz, at: NaiveTime) -> DateTime<Utc> {
    let mut date = after.with_timezone(&tz).date_naive();
    loop {
        if let Some(candidate) = resolve_local(date, at, tz) {
            if candidate > after {
                return candidate;
            }
        }
        date = date.succ_opt().expect("date overflow");
    }
}

fn resolve_local(date: NaiveDate, at: NaiveTime, tz: Tz) -> Option<DateTime<Utc>> {
    let naive = date.and_time(at);
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        chrono::LocalResult::Ambiguous(earlier, _) => Some(earlier.with_timezone(&Utc)),
        chrono::LocalResult::None => {
            // DST gap; scan forward in minute steps until the clock exists
            // again. Gaps are an hour in practice, three is a safe bound.
            for step in 1..=180 {
                let probe = naive + Duration::minutes(step);
                match tz.from_local_datetime(&probe) {
                    chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                    chrono::LocalResult::Ambiguous(earlier, _) => {
                        return Some(earlier.with_timezone(&Utc))
                    }
                    chrono::LocalResult::None => continue,
                }
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as DaybriefResult;
    use crate::fetch::{FetchOutcome, Fetcher};
    use crate::store::Store;
    use crate::summarizer::{Summarizer, SummaryOutput};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MOSCOW: Tz = chrono_tz::Europe::Moscow;
    const NEW_YORK: Tz = chrono_tz::America::New_York;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn test_config() -> Config {
        Config {
            database_url: ":memory:".to_string(),
            source_feed_url: "http://localhost:9000/feed".to_string(),
            openai_api_base: None,
            openai_api_key: "test".to_string(),
            openai_model: "test-model".to_string(),
            summary_max_tokens: 500,
            summary_temperature: 0.0,
            summary_timeout_secs: 5,
            summary_max_input_chars: 8000,
            scheduler_timezone: chrono_tz::UTC,
            dump_hour: 15,
            dump_minute: 0,
            push_offset_minutes: 7,
            fetch_timeout_secs: 5,
            fetch_limit: 100,
            webhook_url: None,
            backfill_days: 10,
        }
    }

    /// Fetcher that sleeps inside the call so a second fire lands while the
    /// first is still running.
    struct SlowFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for SlowFetcher {
        async fn fetch_since(&self, _watermark: DateTime<Utc>, _limit: usize) -> FetchOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            FetchOutcome::default()
        }
    }

    struct NullSummarizer;

    #[async_trait]
    impl Summarizer for NullSummarizer {
        async fn summarize(&self, _payload: &str, _day_key: &str) -> DaybriefResult<SummaryOutput> {
            Ok(SummaryOutput {
                text: "summary".to_string(),
                key_topics: vec![],
            })
        }
    }

    fn scheduler_with_slow_fetch() -> (Arc<DailyScheduler>, Arc<SlowFetcher>) {
        let store = Store::open(":memory:").unwrap();
        store.init().unwrap();
        let fetcher = Arc::new(SlowFetcher {
            calls: AtomicUsize::new(0),
        });
        let digest = Arc::new(crate::digest::DigestService::new(
            store,
            Arc::new(NullSummarizer),
            fetcher.clone(),
            &test_config(),
        ));
        let scheduler = Arc::new(DailyScheduler::new(digest, None, &test_config()).unwrap());
        (scheduler, fetcher)
    }

    #[tokio::test]
    async fn test_overlapping_fires_run_job_once() {
        let (scheduler, fetcher) = scheduler_with_slow_fetch();

        let a = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.fire(Job::Dump).await })
        };
        let b = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.fire(Job::Dump).await })
        };
        a.await.unwrap();
        b.await.unwrap();

        // The second fire found the job lock held and skipped.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        // Once the first invocation completes the lock is free again.
        scheduler.fire(Job::Dump).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_jobs_with_different_names_do_not_exclude_each_other() {
        let (scheduler, fetcher) = scheduler_with_slow_fetch();

        let dump = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.fire(Job::Dump).await })
        };
        let push = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.fire(Job::Push).await })
        };
        dump.await.unwrap();
        push.await.unwrap();

        // Self-exclusion is per job name; both jobs ran their ingest.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_job_loops() {
        let (scheduler, _fetcher) = scheduler_with_slow_fetch();
        let (tx, rx) = watch::channel(false);

        let handles = scheduler.start(rx);
        tx.send(true).unwrap();

        for handle in handles {
            tokio::time::timeout(std::time::Duration::from_secs(1), handle)
                .await
                .expect("job loop should stop after the shutdown signal")
                .unwrap();
        }
    }

    #[test]
    fn test_next_fire_same_day() {
        // 15:00 Moscow is 12:00 UTC; asking at 08:00 UTC fires today.
        let now = Utc.with_ymd_and_hms(2025, 9, 20, 8, 0, 0).unwrap();
        let fire = next_fire(now, MOSCOW, at(15, 0));
        assert_eq!(fire, Utc.with_ymd_and_hms(2025, 9, 20, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_rolls_to_next_day() {
        let now = Utc.with_ymd_and_hms(2025, 9, 20, 12, 0, 0).unwrap();
        let fire = next_fire(now, MOSCOW, at(15, 0));
        // Exactly at the fire instant counts as passed.
        assert_eq!(fire, Utc.with_ymd_and_hms(2025, 9, 21, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_across_local_midnight() {
        // 21:30 UTC on the 20th is already 00:30 on the 21st in Moscow, so a
        // 15:00 job next fires on the Moscow 21st.
        let now = Utc.with_ymd_and_hms(2025, 9, 20, 21, 30, 0).unwrap();
        let fire = next_fire(now, MOSCOW, at(15, 0));
        assert_eq!(fire, Utc.with_ymd_and_hms(2025, 9, 21, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_skipped_by_dst_gap() {
        // 2025-03-09 02:30 does not exist in New York; the job resolves to
        // the first instant after the gap (03:00 EDT = 07:00 UTC).
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 5, 0, 0).unwrap();
        let fire = next_fire(now, NEW_YORK, at(2, 30));
        assert_eq!(fire, Utc.with_ymd_and_hms(2025, 3, 9, 7, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_ambiguous_takes_earlier() {
        // 2025-11-02 01:30 occurs twice in New York; the earlier (EDT,
        // 05:30 UTC) wins.
        let now = Utc.with_ymd_and_hms(2025, 11, 2, 4, 0, 0).unwrap();
        let fire = next_fire(now, NEW_YORK, at(1, 30));
        assert_eq!(fire, Utc.with_ymd_and_hms(2025, 11, 2, 5, 30, 0).unwrap());
    }

    #[test]
    fn test_push_time_offset_wraps_midnight() {
        assert_eq!(shift_minutes(at(15, 0), 7), at(15, 7));
        assert_eq!(shift_minutes(at(23, 58), 7), at(0, 5));
    }
}

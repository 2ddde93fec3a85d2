use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::{DaybriefError, Result};
use crate::models::{day_key_for, Artifact, Item, SourceMeta, StoreStats};

/// Persistent state: the unified item collection keyed by source id, and the
/// per-day summary cache. Both live in one SQLite database behind a single
/// connection, so every method holds the connection lock for its full
/// duration and readers always see a consistent snapshot.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn init(&self) -> Result<()> {
        info!("Store: initializing schema");
        let sql = "
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                text TEXT NOT NULL,
                meta TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_items_timestamp ON items (timestamp);

            CREATE TABLE IF NOT EXISTS summaries (
                day_key TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                key_topics TEXT NOT NULL DEFAULT '[]',
                source_item_count INTEGER NOT NULL,
                generated_at INTEGER NOT NULL
            );
        ";
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(sql)?;
        debug!("Store: schema initialized");
        Ok(())
    }

    /// Merges a batch of fetched items into the store. First write wins: an
    /// incoming item whose id is already present is ignored entirely. The
    /// whole batch lands in one transaction, so a failed merge leaves the
    /// store untouched. Returns the number of items that were actually new.
    pub fn merge_items(&self, incoming: &[Item]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut new_count = 0usize;
        for item in incoming {
            let meta = serde_json::to_string(&item.meta)?;
            new_count += tx.execute(
                "INSERT OR IGNORE INTO items (id, timestamp, text, meta) VALUES (?1, ?2, ?3, ?4)",
                params![item.id, item.timestamp.timestamp(), item.text, meta],
            )?;
        }
        tx.commit()?;
        debug!("Store: merged batch, {} new of {}", new_count, incoming.len());
        Ok(new_count)
    }

    /// Items whose timestamp falls on `day_key` in `tz`, sorted by timestamp
    /// ascending with id as tie-break. Derived from the item table on every
    /// call; never cached.
    pub fn items_for_day(&self, day_key: &str, tz: Tz) -> Result<Vec<Item>> {
        let conn = self.conn.lock().unwrap();
        day_items(&conn, day_key, tz)
    }

    /// Items for the day plus their count, read under one connection lock.
    /// The count is what the orchestrator records as `source_item_count`, so
    /// it must describe exactly the items handed to the summarizer.
    pub fn day_snapshot(&self, day_key: &str, tz: Tz) -> Result<(Vec<Item>, usize)> {
        let conn = self.conn.lock().unwrap();
        let items = day_items(&conn, day_key, tz)?;
        let count = items.len();
        Ok((items, count))
    }

    /// Fetch watermark: the newest stored item timestamp.
    pub fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let max: Option<i64> =
            conn.query_row("SELECT MAX(timestamp) FROM items", [], |row| row.get(0))?;
        max.map(timestamp_from_secs).transpose()
    }

    pub fn stats(&self, tz: Tz) -> Result<StoreStats> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT timestamp FROM items")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;

        let mut stats = StoreStats::default();
        for row in rows {
            let ts = timestamp_from_secs(row?)?;
            stats.total_items += 1;
            if stats.latest_timestamp.map_or(true, |latest| ts > latest) {
                stats.latest_timestamp = Some(ts);
            }
            *stats.per_day_counts.entry(day_key_for(ts, tz)).or_insert(0) += 1;
        }
        Ok(stats)
    }

    /// Reads the cached artifact for a day, if any. The live item count for
    /// the day is compared against the recorded `source_item_count` and the
    /// result is flagged stale on mismatch; the artifact is still returned
    /// so cheap read paths keep working.
    pub fn get_summary(&self, day_key: &str, tz: Tz) -> Result<Option<Artifact>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT text, key_topics, source_item_count, generated_at
             FROM summaries WHERE day_key = ?1",
        )?;
        let mut rows = stmt.query([day_key])?;

        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let text: String = row.get(0)?;
        let key_topics: String = row.get(1)?;
        let source_item_count: usize = row.get::<_, i64>(2)? as usize;
        let generated_at = timestamp_from_millis(row.get(3)?)?;

        let live_count = day_items(&conn, day_key, tz)?.len();
        Ok(Some(Artifact {
            day_key: day_key.to_string(),
            text,
            key_topics: serde_json::from_str(&key_topics)?,
            source_item_count,
            generated_at,
            stale: live_count != source_item_count,
        }))
    }

    /// Atomic replace: at most one artifact per day key, and readers see
    /// either the previous row or the new one, never a torn write.
    pub fn put_summary(&self, artifact: &Artifact) -> Result<()> {
        let key_topics = serde_json::to_string(&artifact.key_topics)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO summaries (day_key, text, key_topics, source_item_count, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(day_key) DO UPDATE SET
                 text = ?2, key_topics = ?3, source_item_count = ?4, generated_at = ?5",
            params![
                artifact.day_key,
                artifact.text,
                key_topics,
                artifact.source_item_count as i64,
                // Millisecond precision: the orchestrator compares this
                // against the instant a waiter started waiting.
                artifact.generated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Invalidates one cached artifact. Returns whether one existed.
    pub fn clear_summary(&self, day_key: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM summaries WHERE day_key = ?1", [day_key])?;
        Ok(deleted > 0)
    }

    /// Bulk clear of items and summaries in one transaction, so the cache
    /// never ends up referencing items that no longer exist.
    pub fn clear_all(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM items", [])?;
        tx.execute("DELETE FROM summaries", [])?;
        tx.commit()?;
        info!("Store: cleared all items and summaries");
        Ok(())
    }
}

fn day_items(conn: &Connection, day_key: &str, tz: Tz) -> Result<Vec<Item>> {
    let mut stmt =
        conn.prepare("SELECT id, timestamp, text, meta FROM items ORDER BY timestamp, id")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    // Single-channel volume stays small, so a full scan with per-item
    // timezone conversion is fine and keeps DST handling exact.
    let mut items = Vec::new();
    for row in rows {
        let (id, secs, text, meta) = row?;
        let timestamp = timestamp_from_secs(secs)?;
        if day_key_for(timestamp, tz) != day_key {
            continue;
        }
        items.push(Item {
            id,
            timestamp,
            text,
            meta: serde_json::from_str::<SourceMeta>(&meta)?,
        });
    }
    Ok(items)
}

fn timestamp_from_secs(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| DaybriefError::Storage(format!("timestamp out of range: {}", secs)))
}

fn timestamp_from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| DaybriefError::Storage(format!("timestamp out of range: {}", millis)))
}

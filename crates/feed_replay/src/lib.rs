use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use core_types::{BookUpdate, DynStream, MarketDataSource};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

/// One captured feed update with its original arrival time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedUpdate {
    pub ts_ms: i64,
    pub update: BookUpdate,
}

/// Captures a live feed to jsonl, one update per line, so a session can be
/// replayed later. Appends follow the same single-`writeln!` line-atomic
/// convention as the event log.
pub struct JsonlFeedRecorder {
    file: File,
}

impl JsonlFeedRecorder {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open feed capture {}", path.display()))?;
        Ok(Self { file })
    }

    pub fn record(&mut self, ts_ms: i64, update: &BookUpdate) -> Result<()> {
        let line = serde_json::to_string(&RecordedUpdate {
            ts_ms,
            update: update.clone(),
        })?;
        writeln!(self.file, "{line}")?;
        Ok(())
    }
}

/// Replays a capture as a `MarketDataSource`. Each record's offset from the
/// first is mapped onto an absolute deadline on the tokio clock
/// (`start + offset / speed`), so replay timing cannot drift from
/// accumulated per-gap rounding. The stream can be taken once.
pub struct JsonlReplayFeed {
    records: Mutex<Option<Vec<RecordedUpdate>>>,
    speed: f64,
}

impl JsonlReplayFeed {
    pub fn open(path: impl AsRef<Path>, speed: f64) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read feed capture {}", path.display()))?;
        let mut records = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: RecordedUpdate = serde_json::from_str(line)
                .with_context(|| format!("capture line {} is not a recorded update", idx + 1))?;
            records.push(record);
        }
        Ok(Self {
            records: Mutex::new(Some(records)),
            speed: speed.max(0.001),
        })
    }
}

#[async_trait]
impl MarketDataSource for JsonlReplayFeed {
    async fn stream_updates(&self) -> Result<DynStream<BookUpdate>> {
        let Some(records) = self.records.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            bail!("replay stream already taken");
        };
        let speed = self.speed;
        let first_ts = records.first().map(|r| r.ts_ms).unwrap_or(0);
        let start = tokio::time::Instant::now();
        let stream = futures::stream::iter(records).then(move |record| async move {
            let offset = record.ts_ms.saturating_sub(first_ts).max(0) as f64 / speed;
            tokio::time::sleep_until(start + Duration::from_millis(offset as u64)).await;
            Ok(record.update)
        });
        Ok(stream.boxed())
    }
}

/// In-memory feed for tests and deterministic paper runs: emits the given
/// updates back-to-back with no pacing.
pub struct VecReplayFeed {
    updates: Mutex<Option<Vec<BookUpdate>>>,
}

impl VecReplayFeed {
    pub fn new(updates: Vec<BookUpdate>) -> Self {
        Self {
            updates: Mutex::new(Some(updates)),
        }
    }
}

#[async_trait]
impl MarketDataSource for VecReplayFeed {
    async fn stream_updates(&self) -> Result<DynStream<BookUpdate>> {
        let Some(updates) = self.updates.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            bail!("replay stream already taken");
        };
        Ok(futures::stream::iter(updates.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::Side;

    fn update(ts: i64, bid: f64, ask: f64) -> BookUpdate {
        BookUpdate {
            session_id: "20260802-1430".to_string(),
            side: Side::Up,
            bid,
            ask,
            server_ts_ms: ts,
        }
    }

    fn capture_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "bandedge_replay_{tag}_{}.jsonl",
            std::process::id()
        ))
    }

    #[tokio::test]
    async fn capture_then_replay_roundtrip() {
        let path = capture_path("roundtrip");
        let _ = fs::remove_file(&path);

        let mut recorder = JsonlFeedRecorder::create(&path).expect("create recorder");
        recorder
            .record(1_000, &update(1_000, 0.62, 0.64))
            .expect("record");
        recorder
            .record(1_100, &update(1_100, 0.63, 0.65))
            .expect("record");

        let feed = JsonlReplayFeed::open(&path, 1_000.0).expect("open replay");
        let mut stream = feed.stream_updates().await.expect("stream");
        let first = stream.next().await.expect("first").expect("ok");
        assert_eq!(first.bid, 0.62);
        let second = stream.next().await.expect("second").expect("ok");
        assert_eq!(second.ask, 0.65);
        assert!(stream.next().await.is_none());

        let _ = fs::remove_file(&path);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_follows_recorded_offsets() {
        let path = capture_path("pacing");
        let _ = fs::remove_file(&path);

        let mut recorder = JsonlFeedRecorder::create(&path).expect("create recorder");
        recorder.record(0, &update(0, 0.62, 0.64)).expect("record");
        recorder
            .record(2_000, &update(2_000, 0.63, 0.65))
            .expect("record");

        // Speed 2.0 halves the recorded two-second gap.
        let feed = JsonlReplayFeed::open(&path, 2.0).expect("open replay");
        let started = tokio::time::Instant::now();
        let mut stream = feed.stream_updates().await.expect("stream");
        stream.next().await.expect("first").expect("ok");
        stream.next().await.expect("second").expect("ok");
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_millis(1_000) && elapsed < Duration::from_millis(1_100),
            "unexpected pacing: {elapsed:?}"
        );

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn vec_feed_emits_in_order_and_only_once() {
        let feed = VecReplayFeed::new(vec![update(1, 0.62, 0.64), update(2, 0.63, 0.65)]);
        let mut stream = feed.stream_updates().await.expect("stream");
        assert_eq!(stream.next().await.unwrap().unwrap().server_ts_ms, 1);
        assert_eq!(stream.next().await.unwrap().unwrap().server_ts_ms, 2);
        assert!(stream.next().await.is_none());
        assert!(feed.stream_updates().await.is_err());
    }
}

//! Training Sample Logger.
//!
//! Every CSI-driven fusion appends one record pairing the CSI feature vector
//! with the freshest camera count (the pseudo-label). Records go to an
//! append-only JSONL file for offline training.
//!
//! [`TrainingLogger::append`] never blocks on I/O: it pushes into a bounded
//! in-memory queue and wakes a background writer. If the file cannot be
//! written, the writer retries after a delay while the queue keeps the
//! newest `capacity` records, dropping the oldest first.
//!
//! A failed write is rolled back to the end of the last complete line, so
//! the file never holds a torn record and a retry never duplicates one.
//!
//! A separate ring of the last `stats_window` records backs the stats and
//! buffer endpoints.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wifi_occupancy_signal::{FeatureVector, FEATURE_COUNT, FEATURE_VERSION};

use crate::error::PersistenceError;
use crate::protocol::CsiSample;

/// One persisted training sample (one JSON line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    /// Server time of the sample
    pub timestamp: DateTime<Utc>,
    /// Source device
    pub device_id: String,
    /// Layout version of `features`
    pub feature_version: u32,
    /// Extracted features
    pub features: FeatureVector,
    /// Camera-derived pseudo-label
    pub people_count: u32,
    /// RSSI of the sample
    pub rssi: i32,
    /// Raw amplitudes, so features can be recomputed under a new layout
    pub amplitudes: Vec<i32>,
    /// Number of subcarriers
    pub subcarrier_count: usize,
    /// Device-side timestamp
    pub esp_timestamp: u64,
}

impl TrainingRecord {
    /// Build a record for `sample` labelled with `people_count`.
    pub fn new(device_id: &str, sample: &CsiSample, features: FeatureVector, people_count: u32) -> Self {
        Self {
            timestamp: sample.received_at,
            device_id: device_id.to_string(),
            feature_version: FEATURE_VERSION,
            features,
            people_count,
            rssi: sample.rssi,
            amplitudes: sample.amplitudes.clone(),
            subcarrier_count: sample.subcarrier_count(),
            esp_timestamp: sample.device_timestamp,
        }
    }
}

/// Summary over the recent-sample ring and the log file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingStats {
    /// Samples in the file (at start-up) plus samples written since
    pub total_samples: u64,
    /// Samples in the recent ring
    pub buffer_size: usize,
    /// Samples waiting to be written
    pub pending: usize,
    /// Samples dropped because the write queue overflowed
    pub dropped: u64,
    /// Failed write attempts
    pub write_failures: u64,
    /// Pseudo-label histogram over the recent ring
    pub unique_people_counts: BTreeMap<String, u64>,
    /// Mean RSSI over the recent ring
    pub avg_rssi: f64,
    /// Mean subcarrier count over the recent ring
    pub avg_subcarriers: f64,
    /// Feature layout version
    pub feature_version: u32,
    /// Feature vector length
    pub feature_count: usize,
}

/// State of the log file on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingFileInfo {
    /// File path
    pub path: PathBuf,
    /// Whether the file exists
    pub exists: bool,
    /// Line count
    pub samples: u64,
    /// File size
    pub size_bytes: u64,
}

struct Inner {
    path: PathBuf,
    capacity: usize,
    window: usize,
    retry: Duration,
    pending: Mutex<VecDeque<(u64, TrainingRecord)>>,
    recent: Mutex<VecDeque<TrainingRecord>>,
    next_seq: AtomicU64,
    preexisting: u64,
    persisted: AtomicU64,
    dropped: AtomicU64,
    write_failures: AtomicU64,
    wake: Notify,
    stop: Notify,
    stopping: AtomicBool,
}

/// Handle to the training logger. Cheap to clone.
#[derive(Clone)]
pub struct TrainingLogger {
    inner: Arc<Inner>,
}

impl TrainingLogger {
    /// Create a logger for `path`.
    ///
    /// Counts the lines already in the file so `total_samples` survives
    /// restarts. The writer is not started; see [`TrainingLogger::spawn_writer`].
    pub fn new(path: impl Into<PathBuf>, capacity: usize, window: usize, retry: Duration) -> Self {
        let path = path.into();
        let preexisting = count_lines(&path);
        if preexisting > 0 {
            info!(path = %path.display(), samples = preexisting, "Existing training log found");
        }
        Self {
            inner: Arc::new(Inner {
                path,
                capacity: capacity.max(1),
                window: window.max(1),
                retry,
                pending: Mutex::new(VecDeque::new()),
                recent: Mutex::new(VecDeque::new()),
                next_seq: AtomicU64::new(0),
                preexisting,
                persisted: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                write_failures: AtomicU64::new(0),
                wake: Notify::new(),
                stop: Notify::new(),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Queue a record for writing. Never blocks on I/O.
    pub fn append(&self, record: TrainingRecord) {
        let inner = &self.inner;
        {
            let mut recent = inner.recent.lock();
            if recent.len() >= inner.window {
                recent.pop_front();
            }
            recent.push_back(record.clone());
        }
        {
            let mut pending = inner.pending.lock();
            let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
            while pending.len() >= inner.capacity {
                pending.pop_front();
                inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            pending.push_back((seq, record));
        }
        inner.wake.notify_one();
    }

    /// Write everything queued so far. Blocking; called from the writer
    /// task on a blocking thread and at shutdown.
    ///
    /// Records written before a failure are dequeued; the rest stay queued.
    pub fn flush(&self) -> Result<usize, PersistenceError> {
        let inner = &self.inner;
        let batch: Vec<(u64, TrainingRecord)> = inner.pending.lock().iter().cloned().collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let mut lines = Vec::with_capacity(batch.len());
        for (_, record) in &batch {
            let mut line = serde_json::to_string(record)?;
            line.push('\n');
            lines.push(line);
        }

        let (written, result) = match open_log(&inner.path) {
            Ok(mut file) => append_lines(&mut file, &lines),
            Err(e) => (0, Err(e)),
        };

        if let Some(last_seq) = written.checked_sub(1).map(|i| batch[i].0) {
            // Records may have been dropped on overflow meanwhile; remove
            // only what was actually written.
            let mut pending = inner.pending.lock();
            while pending.front().is_some_and(|(seq, _)| *seq <= last_seq) {
                pending.pop_front();
            }
            drop(pending);
            inner.persisted.fetch_add(written as u64, Ordering::Relaxed);
        }

        match result {
            Ok(()) => Ok(written),
            Err(e) => {
                inner.write_failures.fetch_add(1, Ordering::Relaxed);
                Err(PersistenceError::io(&inner.path, e))
            }
        }
    }

    /// Start the background writer.
    pub fn spawn_writer(&self) -> JoinHandle<()> {
        let logger = self.clone();
        tokio::spawn(async move { logger.writer_loop().await })
    }

    async fn writer_loop(self) {
        let inner = self.inner.clone();
        info!(path = %inner.path.display(), "Training log writer started");
        loop {
            if inner.stopping.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                _ = inner.wake.notified() => {}
                _ = inner.stop.notified() => break,
            }

            loop {
                let logger = self.clone();
                match tokio::task::spawn_blocking(move || logger.flush()).await {
                    Ok(Ok(n)) => {
                        if n > 0 {
                            debug!(written = n, "Training samples persisted");
                        }
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(
                            error = %e,
                            buffered = self.pending_len(),
                            retry_ms = inner.retry.as_millis() as u64,
                            "Training log write failed, will retry"
                        );
                    }
                    Err(e) => warn!(error = %e, "Training log writer task failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(inner.retry) => {}
                    _ = inner.stop.notified() => {
                        inner.stopping.store(true, Ordering::Release);
                        break;
                    }
                }
            }
        }

        match self.flush() {
            Ok(n) if n > 0 => info!(written = n, "Final training log flush"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, lost = self.pending_len(), "Final training log flush failed"),
        }
        info!("Training log writer stopped");
    }

    /// Ask the writer to make a final flush and exit.
    pub fn shutdown(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.stop.notify_one();
    }

    /// Records waiting to be written.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Up to `limit` most recent records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<TrainingRecord> {
        let recent = self.inner.recent.lock();
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    /// Empty the recent ring, returning how many records it held. Does not
    /// touch the file or the write queue.
    pub fn clear_recent(&self) -> usize {
        let mut recent = self.inner.recent.lock();
        let n = recent.len();
        recent.clear();
        n
    }

    /// Current statistics.
    pub fn stats(&self) -> TrainingStats {
        let inner = &self.inner;
        let recent = inner.recent.lock();

        let mut unique_people_counts = BTreeMap::new();
        let mut rssi_sum = 0.0;
        let mut subcarrier_sum = 0.0;
        for r in recent.iter() {
            *unique_people_counts.entry(r.people_count.to_string()).or_insert(0) += 1;
            rssi_sum += f64::from(r.rssi);
            subcarrier_sum += r.subcarrier_count as f64;
        }
        let n = recent.len();
        let mean = |sum: f64| if n == 0 { 0.0 } else { sum / n as f64 };

        TrainingStats {
            total_samples: inner.preexisting + inner.persisted.load(Ordering::Relaxed),
            buffer_size: n,
            pending: inner.pending.lock().len(),
            dropped: inner.dropped.load(Ordering::Relaxed),
            write_failures: inner.write_failures.load(Ordering::Relaxed),
            unique_people_counts,
            avg_rssi: mean(rssi_sum),
            avg_subcarriers: mean(subcarrier_sum),
            feature_version: FEATURE_VERSION,
            feature_count: FEATURE_COUNT,
        }
    }

    /// Inspect the file on disk. Blocking.
    pub fn file_info(&self) -> TrainingFileInfo {
        let path = &self.inner.path;
        match std::fs::metadata(path) {
            Ok(meta) => TrainingFileInfo {
                path: path.clone(),
                exists: true,
                samples: count_lines(path),
                size_bytes: meta.len(),
            },
            Err(_) => TrainingFileInfo {
                path: path.clone(),
                exists: false,
                samples: 0,
                size_bytes: 0,
            },
        }
    }

    /// Log path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl std::fmt::Debug for TrainingLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingLogger")
            .field("path", &self.inner.path)
            .field("capacity", &self.inner.capacity)
            .field("pending", &self.pending_len())
            .finish()
    }
}

/// Append-only destination that can be cut back to a known length.
trait LogSink: Write {
    fn len(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogSink for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

fn open_log(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Append whole lines. On failure the sink is cut back to the end of the
/// last complete line; returns how many lines made it.
fn append_lines<S: LogSink>(sink: &mut S, lines: &[String]) -> (usize, io::Result<()>) {
    let mut end = match sink.len() {
        Ok(len) => len,
        Err(e) => return (0, Err(e)),
    };
    for (i, line) in lines.iter().enumerate() {
        let written = sink.write_all(line.as_bytes()).and_then(|()| sink.flush());
        if let Err(e) = written {
            if let Err(cut) = sink.truncate(end) {
                warn!(error = %cut, "Could not roll back partial training record");
            }
            return (i, Err(e));
        }
        end += line.len() as u64;
    }
    (lines.len(), Ok(()))
}

fn count_lines(path: &Path) -> u64 {
    match std::fs::File::open(path) {
        Ok(f) => BufReader::new(f).lines().map_while(Result::ok).count() as u64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(people: u32, rssi: i32) -> TrainingRecord {
        let sample = CsiSample {
            device_timestamp: 42,
            rssi,
            amplitudes: vec![1, 2, 3, 4],
            received_at: Utc::now(),
        };
        TrainingRecord::new("cam", &sample, FeatureVector::zeros(), people)
    }

    #[test]
    fn overflow_drops_oldest() {
        let tmp = tempdir().unwrap();
        let logger = TrainingLogger::new(tmp.path().join("log.jsonl"), 3, 10, Duration::from_millis(10));
        for i in 0..5 {
            logger.append(record(i, -50));
        }
        assert_eq!(logger.pending_len(), 3);
        assert_eq!(logger.stats().dropped, 2);

        logger.flush().unwrap();
        let text = std::fs::read_to_string(logger.path()).unwrap();
        let labels: Vec<u32> = text
            .lines()
            .map(|l| serde_json::from_str::<TrainingRecord>(l).unwrap().people_count)
            .collect();
        assert_eq!(labels, vec![2, 3, 4]);
    }

    #[test]
    fn failed_write_keeps_records_queued() {
        let tmp = tempdir().unwrap();
        // A directory where the file should be makes every open fail.
        let path = tmp.path().join("blocked");
        std::fs::create_dir(&path).unwrap();
        let logger = TrainingLogger::new(&path, 10, 10, Duration::from_millis(10));

        logger.append(record(1, -40));
        assert!(logger.flush().is_err());
        assert_eq!(logger.pending_len(), 1);
        assert_eq!(logger.stats().write_failures, 1);
        assert_eq!(logger.stats().total_samples, 0);
    }

    /// Accepts `budget` bytes, then fails like a full disk.
    struct FullDisk {
        data: Vec<u8>,
        budget: usize,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.budget.saturating_sub(self.data.len());
            if room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = room.min(buf.len());
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogSink for FullDisk {
        fn len(&self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn partial_write_is_rolled_back_to_last_whole_line() {
        let lines: Vec<String> = (0..3)
            .map(|i| format!("{}\n", serde_json::to_string(&record(i, -50)).unwrap()))
            .collect();
        // Room for the first record and half of the second.
        let budget = lines[0].len() + lines[1].len() / 2;
        let mut disk = FullDisk {
            data: Vec::new(),
            budget,
        };

        let (written, result) = append_lines(&mut disk, &lines);
        assert_eq!(written, 1);
        assert!(result.is_err());
        assert_eq!(disk.data, lines[0].as_bytes());

        // Space frees up; the retry appends only what is missing.
        disk.budget = usize::MAX;
        let (written, result) = append_lines(&mut disk, &lines[written..]);
        assert_eq!(written, 2);
        assert!(result.is_ok());

        let text = String::from_utf8(disk.data).unwrap();
        let labels: Vec<u32> = text
            .lines()
            .map(|l| serde_json::from_str::<TrainingRecord>(l).unwrap().people_count)
            .collect();
        assert_eq!(labels, vec![0, 1, 2]);
    }

    #[test]
    fn stats_summarise_recent_ring() {
        let tmp = tempdir().unwrap();
        let logger = TrainingLogger::new(tmp.path().join("log.jsonl"), 10, 3, Duration::from_millis(10));
        logger.append(record(0, -60));
        logger.append(record(1, -50));
        logger.append(record(1, -40));
        logger.append(record(2, -30));

        let stats = logger.stats();
        assert_eq!(stats.buffer_size, 3);
        assert_eq!(stats.unique_people_counts.get("1"), Some(&2));
        assert_eq!(stats.unique_people_counts.get("2"), Some(&1));
        assert!(stats.unique_people_counts.get("0").is_none());
        assert_eq!(stats.avg_rssi, -40.0);
        assert_eq!(stats.avg_subcarriers, 4.0);

        assert_eq!(logger.recent(2).len(), 2);
        assert_eq!(logger.recent(2)[1].people_count, 2);
        assert_eq!(logger.clear_recent(), 3);
        assert_eq!(logger.stats().buffer_size, 0);
        assert_eq!(logger.pending_len(), 4);
    }

    #[test]
    fn existing_lines_are_counted() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("log.jsonl");
        std::fs::write(&path, "{}\n{}\n").unwrap();
        let logger = TrainingLogger::new(&path, 10, 10, Duration::from_millis(10));
        assert_eq!(logger.stats().total_samples, 2);

        logger.append(record(3, -45));
        logger.flush().unwrap();
        assert_eq!(logger.stats().total_samples, 3);
        let info = logger.file_info();
        assert!(info.exists);
        assert_eq!(info.samples, 3);
        assert!(info.size_bytes > 0);
    }

    #[tokio::test]
    async fn writer_persists_in_background() {
        let tmp = tempdir().unwrap();
        let logger = TrainingLogger::new(tmp.path().join("sub/log.jsonl"), 10, 10, Duration::from_millis(10));
        let writer = logger.spawn_writer();

        logger.append(record(1, -50));
        for _ in 0..100 {
            if logger.pending_len() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(logger.pending_len(), 0);

        logger.shutdown();
        tokio::time::timeout(Duration::from_secs(2), writer).await.unwrap().unwrap();
        assert_eq!(logger.file_info().samples, 1);
    }
}

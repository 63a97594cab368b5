//! Progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for one request.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Jobs handed to the executor
    pub jobs_submitted: AtomicU64,

    /// Jobs that produced a partial result
    pub jobs_succeeded: AtomicU64,

    /// Jobs that ended in a job error
    pub jobs_failed: AtomicU64,

    /// Failed jobs whose last attempt hit the deadline
    pub jobs_timed_out: AtomicU64,

    /// Extra attempts made after a failure
    pub job_retries: AtomicU64,

    /// Records written into partitions
    pub records_dispatched: AtomicU64,

    /// Records excluded by length filtering or parse errors
    pub records_skipped: AtomicU64,

    /// Raw tool output captured
    pub output_bytes: AtomicU64,

    /// Data rows in the merged result
    pub rows_merged: AtomicU64,

    /// Wall time spent inside tool processes, summed across jobs (microseconds)
    pub process_us: AtomicU64,

    /// Time spent merging (microseconds)
    pub merge_us: AtomicU64,

    start_time: Option<Instant>,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_job_submitted(&self, count: u64) {
        self.jobs_submitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_job_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed job.
    pub fn add_job_failed(&self, timed_out: bool) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.jobs_timed_out.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Move jobs whose output the merge rejected from succeeded to failed.
    pub fn reclassify_rejected(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.jobs_succeeded.fetch_sub(count, Ordering::Relaxed);
        self.jobs_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_retry(&self) {
        self.job_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_records_dispatched(&self, count: u64) {
        self.records_dispatched.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_records_skipped(&self, count: u64) {
        self.records_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_output_bytes(&self, bytes: u64) {
        self.output_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_rows_merged(&self, rows: u64) {
        self.rows_merged.fetch_add(rows, Ordering::Relaxed);
    }

    /// Record time spent in a tool process (in microseconds).
    pub fn add_process_time(&self, duration: Duration) {
        self.process_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent merging (in microseconds).
    pub fn add_merge_time(&self, duration: Duration) {
        self.merge_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Jobs that reached a terminal state.
    pub fn jobs_finished(&self) -> u64 {
        self.jobs_succeeded.load(Ordering::Relaxed) + self.jobs_failed.load(Ordering::Relaxed)
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_timed_out: self.jobs_timed_out.load(Ordering::Relaxed),
            job_retries: self.job_retries.load(Ordering::Relaxed),
            records_dispatched: self.records_dispatched.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
            rows_merged: self.rows_merged.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            process_secs: self.process_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            merge_secs: self.merge_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_timed_out: u64,
    pub job_retries: u64,
    pub records_dispatched: u64,
    pub records_skipped: u64,
    pub output_bytes: u64,
    pub rows_merged: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    /// Total time inside tool processes (seconds, summed across jobs)
    pub process_secs: f64,
    pub merge_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Jobs: {}/{} done, {} failed ({} timed out), {} retries | \
             Records: {} dispatched, {} skipped | Output: {:.1} KB | \
             Rows merged: {} | Elapsed: {:.1}s | Tool time: {:.1}s",
            self.jobs_succeeded + self.jobs_failed,
            self.jobs_submitted,
            self.jobs_failed,
            self.jobs_timed_out,
            self.job_retries,
            self.records_dispatched,
            self.records_skipped,
            self.output_bytes as f64 / 1024.0,
            self.rows_merged,
            self.elapsed.as_secs_f64(),
            self.process_secs,
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_jobs: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_jobs: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
            total_jobs,
        }
    }

    /// Log progress every interval until `shutdown` fires or its sender drops.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let progress = if self.total_jobs > 0 {
                        self.metrics.jobs_finished() as f64 / self.total_jobs as f64 * 100.0
                    } else {
                        0.0
                    };
                    tracing::info!("[{:.1}%] {}", progress, self.metrics.snapshot());
                }
                _ = shutdown.recv() => {
                    tracing::info!("Final: {}", self.metrics.snapshot());
                    break;
                }
            }
        }
    }
}

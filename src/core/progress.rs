//! In-memory progress tracking for active hash jobs.
//!
//! Counters are atomics written by the hashing worker and read by the progress
//! ticker and by callers of `IntegrityHasher::progress`. Nothing here is persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Live counters for one job.
#[derive(Debug)]
pub struct JobProgress {
    total_bytes: AtomicU64,
    bytes_processed: AtomicU64,
    cancelled: AtomicBool,
    registered: Instant,
    /// Offset from `registered` at which hashing actually began, in nanoseconds.
    started_after_ns: AtomicU64,
}

impl Default for JobProgress {
    fn default() -> Self {
        Self {
            total_bytes: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            registered: Instant::now(),
            started_after_ns: AtomicU64::new(0),
        }
    }
}

impl JobProgress {
    pub fn set_total(&self, total: u64) {
        self.total_bytes.store(total, Ordering::Relaxed);
    }

    pub fn set_processed(&self, bytes: u64) {
        self.bytes_processed.store(bytes, Ordering::Relaxed);
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::Relaxed)
    }

    /// 0.0–1.0; a zero-sized job reports 0.0.
    pub fn fraction(&self) -> f64 {
        let total = self.total_bytes();
        if total == 0 {
            return 0.0;
        }
        (self.bytes_processed() as f64 / total as f64).clamp(0.0, 1.0)
    }

    /// Restart the clock once the job holds a hashing slot, so time spent queued
    /// does not count toward throughput.
    pub fn mark_started(&self) {
        let offset = self.registered.elapsed().as_nanos() as u64;
        self.started_after_ns.store(offset, Ordering::Relaxed);
    }

    /// Time since `mark_started`, or since registration if it was never called.
    pub fn elapsed(&self) -> Duration {
        let started_after = Duration::from_nanos(self.started_after_ns.load(Ordering::Relaxed));
        self.registered.elapsed().saturating_sub(started_after)
    }

    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= f64::EPSILON {
            return 0.0;
        }
        self.bytes_processed() as f64 / secs
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Registry of active jobs, shared between the hasher and its callers.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<HashMap<String, Arc<JobProgress>>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a job and return its counters.
    pub async fn register(&self, job_id: &str) -> Arc<JobProgress> {
        let progress = Arc::new(JobProgress::default());
        let mut map = self.inner.write().await;
        map.insert(job_id.to_string(), progress.clone());
        progress
    }

    pub async fn get(&self, job_id: &str) -> Option<Arc<JobProgress>> {
        let map = self.inner.read().await;
        map.get(job_id).cloned()
    }

    /// Remove a job from tracking (called when the job completes, fails or is cancelled).
    pub async fn remove(&self, job_id: &str) {
        let mut map = self.inner.write().await;
        map.remove(job_id);
    }

    pub async fn job_ids(&self) -> Vec<String> {
        let map = self.inner.read().await;
        map.keys().cloned().collect()
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.len()
    }
}

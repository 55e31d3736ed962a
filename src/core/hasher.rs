//! Integrity hashing of raw partitions.
//!
//! Jobs are queued on a semaphore-bounded pool; each running job hashes on the
//! blocking pool while its async driver pushes progress events every
//! [`PROGRESS_INTERVAL`]. Cancellation is cooperative and checked between chunks.

mod algorithm;
mod engine;

pub use algorithm::{HashAlgorithm, ResolvedAlgorithm};
pub use engine::{MAX_BUFFER_SIZE, MIN_BUFFER_SIZE, MMAP_CHUNK_SIZE, effective_buffer_size};

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::progress::{JobProgress, ProgressTracker};
use crate::error::HashError;
use crate::logging::LogThrottle;

pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_CONCURRENT_LIMIT: usize = 4;

#[derive(Debug, Clone)]
pub struct HashJob {
    pub device_path: PathBuf,
    /// Requested algorithm name; unsupported names fall back to SHA256.
    pub algorithm: String,
    pub buffer_size: usize,
    pub use_mmap: bool,
    pub direct_io: bool,
}

impl HashJob {
    pub fn new(device_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
            algorithm: HashAlgorithm::default().to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            use_mmap: true,
            direct_io: true,
        }
    }

    pub fn with_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = algorithm.into();
        self
    }

    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    pub fn with_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }

    pub fn with_direct_io(mut self, direct_io: bool) -> Self {
        self.direct_io = direct_io;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HashResult {
    pub job_id: String,
    pub device_path: PathBuf,
    pub hash: String,
    /// Algorithm actually used.
    pub algorithm: HashAlgorithm,
    pub requested_algorithm: String,
    pub bytes_processed: u64,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl HashResult {
    pub fn algorithm_substituted(&self) -> bool {
        HashAlgorithm::from_name(&self.requested_algorithm) != Some(self.algorithm)
    }
}

#[derive(Debug, Clone)]
pub enum HashEvent {
    Started {
        job_id: String,
        device_path: PathBuf,
    },
    Progress {
        job_id: String,
        fraction: f64,
        bytes_processed: u64,
        bytes_per_sec: f64,
    },
    Completed(HashResult),
    Failed(HashResult),
    Cancelled {
        job_id: String,
        device_path: PathBuf,
    },
}

impl HashEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Started { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Cancelled { job_id, .. } => job_id,
            Self::Completed(result) | Self::Failed(result) => &result.job_id,
        }
    }
}

#[derive(Clone)]
pub struct IntegrityHasher {
    inner: Arc<HasherInner>,
}

struct HasherInner {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    tracker: ProgressTracker,
    events: mpsc::Sender<HashEvent>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl IntegrityHasher {
    /// `max_concurrent` is clamped to 1..=4.
    pub fn new(max_concurrent: usize, events: mpsc::Sender<HashEvent>) -> Self {
        let max_concurrent = max_concurrent.clamp(1, MAX_CONCURRENT_LIMIT);
        Self {
            inner: Arc::new(HasherInner {
                permits: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent,
                tracker: ProgressTracker::new(),
                events,
                running: AtomicUsize::new(0),
                peak_running: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue a job and return its id immediately.
    pub async fn start_hash(&self, job: HashJob) -> String {
        let job_id = Uuid::now_v7().to_string();
        let progress = self.inner.tracker.register(&job_id).await;
        let span = info_span!(
            "hash_job",
            job_id = %job_id,
            device = %job.device_path.display()
        );

        let inner = self.inner.clone();
        let id = job_id.clone();
        tokio::spawn(async move { inner.run_job(id, job, progress).await }.instrument(span));

        job_id
    }

    /// Returns false if the job is unknown or already finished.
    pub async fn cancel_hash(&self, job_id: &str) -> bool {
        match self.inner.tracker.get(job_id).await {
            Some(progress) => {
                progress.cancel();
                debug!(job_id = %job_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) {
        for job_id in self.inner.tracker.job_ids().await {
            self.cancel_hash(&job_id).await;
        }
    }

    pub async fn progress(&self, job_id: &str) -> f64 {
        match self.inner.tracker.get(job_id).await {
            Some(progress) => progress.fraction(),
            None => 0.0,
        }
    }

    pub async fn is_running(&self, job_id: &str) -> bool {
        self.inner.tracker.get(job_id).await.is_some()
    }

    /// Jobs queued or running.
    pub async fn active_job_count(&self) -> usize {
        self.inner.tracker.active_count().await
    }

    /// Jobs currently consuming I/O.
    pub fn running_count(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running jobs observed.
    pub fn peak_running(&self) -> usize {
        self.inner.peak_running.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }
}

impl HasherInner {
    async fn run_job(self: Arc<Self>, job_id: String, job: HashJob, progress: Arc<JobProgress>) {
        let acquire = self.permits.clone().acquire_owned();
        tokio::pin!(acquire);
        let permit = loop {
            tokio::select! {
                permit = &mut acquire => break permit.ok(),
                _ = tokio::time::sleep(PROGRESS_INTERVAL) => {
                    if progress.is_cancelled() {
                        break None;
                    }
                }
            }
        };

        if permit.is_none() || progress.is_cancelled() {
            info!("Hash cancelled before it started");
            self.tracker.remove(&job_id).await;
            let _ = self
                .events
                .send(HashEvent::Cancelled {
                    job_id,
                    device_path: job.device_path,
                })
                .await;
            return;
        }

        progress.mark_started();
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(running, Ordering::SeqCst);

        let resolved = HashAlgorithm::resolve(&job.algorithm);
        if let Some(requested) = &resolved.substituted_for {
            warn!(
                requested = %requested,
                using = %resolved.algorithm,
                "Unsupported hash algorithm, falling back"
            );
        }

        info!(algorithm = %resolved.algorithm, mmap = job.use_mmap, "Hashing started");
        let _ = self
            .events
            .send(HashEvent::Started {
                job_id: job_id.clone(),
                device_path: job.device_path.clone(),
            })
            .await;

        let started = Instant::now();
        let worker = {
            let job = job.clone();
            let progress = progress.clone();
            let algorithm = resolved.algorithm;
            tokio::task::spawn_blocking(move || engine::hash_device(&job, algorithm, &progress))
        };
        tokio::pin!(worker);

        let throttle = LogThrottle::new(Duration::from_secs(5));
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let joined = loop {
            tokio::select! {
                joined = &mut worker => break joined,
                _ = ticker.tick() => {
                    let fraction = progress.fraction();
                    let bytes_processed = progress.bytes_processed();
                    if throttle.should_log() {
                        debug!(
                            percent = format!("{:.1}", fraction * 100.0),
                            bytes_processed,
                            "Hash progress"
                        );
                    }
                    // Progress is lossy; never stall the worker on a slow consumer.
                    let _ = self.events.try_send(HashEvent::Progress {
                        job_id: job_id.clone(),
                        fraction,
                        bytes_processed,
                        bytes_per_sec: progress.bytes_per_sec(),
                    });
                }
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.tracker.remove(&job_id).await;

        let mut result = HashResult {
            job_id: job_id.clone(),
            device_path: job.device_path.clone(),
            hash: String::new(),
            algorithm: resolved.algorithm,
            requested_algorithm: job.algorithm.clone(),
            bytes_processed: progress.bytes_processed(),
            duration_ms: started.elapsed().as_millis() as u64,
            success: false,
            error: None,
        };

        let event = match joined {
            Ok(Ok(output)) => {
                result.hash = output.hash;
                result.bytes_processed = output.bytes;
                result.success = true;
                info!(
                    bytes = result.bytes_processed,
                    duration_ms = result.duration_ms,
                    "Hashing complete"
                );
                HashEvent::Completed(result)
            }
            Ok(Err(HashError::Cancelled)) => {
                info!(bytes = result.bytes_processed, "Hash cancelled");
                HashEvent::Cancelled {
                    job_id,
                    device_path: job.device_path,
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Hashing failed");
                result.error = Some(e.to_string());
                HashEvent::Failed(result)
            }
            Err(join_error) => {
                error!(error = %join_error, "Hash worker panicked");
                result.error = Some(format!("hash worker failed: {join_error}"));
                HashEvent::Failed(result)
            }
        };

        // Deliver the outcome before the next queued job may start.
        let _ = self.events.send(event).await;
        drop(permit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_defaults() {
        let job = HashJob::new("/dev/sdb1");
        assert_eq!(job.algorithm, "SHA256");
        assert_eq!(job.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(job.use_mmap);
        assert!(job.direct_io);
    }

    #[test]
    fn test_substitution_flag() {
        let mut result = HashResult {
            job_id: "j".into(),
            device_path: PathBuf::from("/dev/sdb1"),
            hash: String::new(),
            algorithm: HashAlgorithm::Sha256,
            requested_algorithm: "sha-256".into(),
            bytes_processed: 0,
            duration_ms: 0,
            success: true,
            error: None,
        };
        assert!(!result.algorithm_substituted());
        result.requested_algorithm = "XXH3-128".into();
        assert!(result.algorithm_substituted());
    }

    #[tokio::test]
    async fn test_concurrency_is_clamped() {
        let (tx, _rx) = mpsc::channel(8);
        assert_eq!(IntegrityHasher::new(0, tx.clone()).max_concurrent(), 1);
        assert_eq!(IntegrityHasher::new(16, tx).max_concurrent(), 4);
    }

    #[tokio::test]
    async fn test_unknown_job_queries() {
        let (tx, _rx) = mpsc::channel(8);
        let hasher = IntegrityHasher::new(1, tx);
        assert!(!hasher.cancel_hash("missing").await);
        assert_eq!(hasher.progress("missing").await, 0.0);
        assert!(!hasher.is_running("missing").await);
    }
}

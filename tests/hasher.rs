use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio::time::timeout;
use usbwarden::core::{HashAlgorithm, HashEvent, HashJob, HashResult, IntegrityHasher};

fn image(len: usize, seed: u8) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..len)
        .map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed))
        .collect();
    file.write_all(&data).unwrap();
    file.flush().unwrap();
    file
}

fn sha256_of(path: &Path) -> String {
    hex::encode(Sha256::digest(std::fs::read(path).unwrap()))
}

async fn next(rx: &mut mpsc::Receiver<HashEvent>) -> HashEvent {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timeout waiting for hash event")
        .expect("channel closed")
}

/// Skip progress events and return the next lifecycle event.
async fn next_lifecycle(rx: &mut mpsc::Receiver<HashEvent>) -> HashEvent {
    loop {
        match next(rx).await {
            HashEvent::Progress { .. } => continue,
            other => return other,
        }
    }
}

async fn run_to_completion(hasher: &IntegrityHasher, rx: &mut mpsc::Receiver<HashEvent>, job: HashJob) -> HashResult {
    let id = hasher.start_hash(job).await;
    loop {
        match next_lifecycle(rx).await {
            HashEvent::Completed(result) if result.job_id == id => return result,
            HashEvent::Failed(result) if result.job_id == id => return result,
            HashEvent::Cancelled { job_id, .. } if job_id == id => panic!("job cancelled"),
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_digest_is_independent_of_read_strategy() {
    let file = image(3 * 1024 * 1024 + 17, 3);
    let expected = sha256_of(file.path());
    let (tx, mut rx) = mpsc::channel(64);
    let hasher = IntegrityHasher::new(2, tx);

    let variants = [
        HashJob::new(file.path()).with_mmap(true),
        HashJob::new(file.path()).with_mmap(false).with_direct_io(false).with_buffer_size(64 * 1024),
        HashJob::new(file.path()).with_mmap(false).with_buffer_size(16 * 1024 * 1024),
    ];

    for job in variants {
        let result = run_to_completion(&hasher, &mut rx, job).await;
        assert!(result.success, "hash failed: {:?}", result.error);
        assert_eq!(result.hash, expected);
        assert_eq!(result.bytes_processed, 3 * 1024 * 1024 + 17);
        assert_eq!(result.algorithm, HashAlgorithm::Sha256);
    }
}

#[tokio::test]
async fn test_unsupported_algorithm_reports_fallback() {
    let file = image(10_000, 1);
    let (tx, mut rx) = mpsc::channel(64);
    let hasher = IntegrityHasher::new(1, tx);

    let result = run_to_completion(&hasher, &mut rx, HashJob::new(file.path()).with_algorithm("XXH3")).await;

    assert!(result.success);
    assert_eq!(result.algorithm, HashAlgorithm::Sha256);
    assert_eq!(result.requested_algorithm, "XXH3");
    assert!(result.algorithm_substituted());
    assert_eq!(result.hash, sha256_of(file.path()));
}

#[tokio::test]
async fn test_blake3_digest() {
    let file = image(100_000, 9);
    let (tx, mut rx) = mpsc::channel(64);
    let hasher = IntegrityHasher::new(1, tx);

    let result = run_to_completion(&hasher, &mut rx, HashJob::new(file.path()).with_algorithm("blake3")).await;

    let expected = blake3::hash(&std::fs::read(file.path()).unwrap()).to_hex().to_string();
    assert_eq!(result.algorithm, HashAlgorithm::Blake3);
    assert!(!result.algorithm_substituted());
    assert_eq!(result.hash, expected);
}

#[tokio::test]
async fn test_cancelled_job_reports_cancelled() {
    let file = image(1024 * 1024, 5);
    let (tx, mut rx) = mpsc::channel(64);
    let hasher = IntegrityHasher::new(1, tx);

    let id = hasher.start_hash(HashJob::new(file.path())).await;
    assert!(hasher.cancel_hash(&id).await);

    match next_lifecycle(&mut rx).await {
        HashEvent::Cancelled { job_id, device_path } => {
            assert_eq!(job_id, id);
            assert_eq!(device_path, file.path());
        }
        other => panic!("expected Cancelled, got {other:?}"),
    }
    assert!(!hasher.is_running(&id).await);
    assert_eq!(hasher.active_job_count().await, 0);
    assert!(!hasher.cancel_hash(&id).await);
}

#[tokio::test]
async fn test_single_slot_runs_jobs_in_sequence() {
    let a = image(2 * 1024 * 1024, 1);
    let b = image(2 * 1024 * 1024, 2);
    let (tx, mut rx) = mpsc::channel(256);
    let hasher = IntegrityHasher::new(1, tx);

    let id_a = hasher.start_hash(HashJob::new(a.path())).await;
    let id_b = hasher.start_hash(HashJob::new(b.path())).await;

    let mut lifecycle = Vec::new();
    while lifecycle.len() < 4 {
        let event = next_lifecycle(&mut rx).await;
        lifecycle.push((event.job_id().to_string(), matches!(event, HashEvent::Started { .. })));
    }

    let first = lifecycle[0].0.clone();
    let second = if first == id_a { id_b.clone() } else { id_a.clone() };
    assert_eq!(
        lifecycle,
        vec![
            (first.clone(), true),
            (first, false),
            (second.clone(), true),
            (second, false),
        ]
    );
    assert_eq!(hasher.peak_running(), 1);
    assert_eq!(hasher.running_count(), 0);
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let files: Vec<_> = (0..5).map(|i| image(512 * 1024, i)).collect();
    let (tx, mut rx) = mpsc::channel(256);
    let hasher = IntegrityHasher::new(2, tx);

    for file in &files {
        hasher.start_hash(HashJob::new(file.path())).await;
    }

    let mut done = 0;
    while done < files.len() {
        if let HashEvent::Completed(_) = next_lifecycle(&mut rx).await {
            done += 1;
        }
        assert!(hasher.running_count() <= 2);
    }
    assert!(hasher.peak_running() <= 2);
    assert!(hasher.peak_running() >= 1);
}

#[tokio::test]
async fn test_zero_size_device() {
    let file = NamedTempFile::new().unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    let hasher = IntegrityHasher::new(1, tx);

    let result = run_to_completion(&hasher, &mut rx, HashJob::new(file.path())).await;

    assert!(result.success);
    assert_eq!(result.bytes_processed, 0);
    assert_eq!(
        result.hash,
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}

#[tokio::test]
async fn test_missing_device_fails() {
    let (tx, mut rx) = mpsc::channel(64);
    let hasher = IntegrityHasher::new(1, tx);

    let result = run_to_completion(&hasher, &mut rx, HashJob::new("/nonexistent/usbwarden-sdz1")).await;

    assert!(!result.success);
    assert!(result.hash.is_empty());
    let error = result.error.expect("error message");
    assert!(error.contains("/nonexistent/usbwarden-sdz1"), "{error}");
}

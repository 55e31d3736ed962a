use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::Path;

use memmap2::{Advice, MmapOptions};
use tracing::{debug, warn};

use super::HashJob;
use super::algorithm::{Digester, HashAlgorithm};
use crate::core::progress::JobProgress;
use crate::error::HashError;

/// Size of each memory-mapped window.
pub const MMAP_CHUNK_SIZE: u64 = 256 * 1024 * 1024;

pub const MIN_BUFFER_SIZE: usize = 64 * 1024;
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// O_DIRECT needs buffer address and length aligned to the logical block size.
const DIRECT_IO_ALIGN: usize = 4096;

nix::ioctl_read!(blk_get_size64, 0x12, 114, u64);

pub(crate) struct DigestOutput {
    pub hash: String,
    pub bytes: u64,
}

/// Hash a whole device or image file. Runs on the blocking pool.
pub(crate) fn hash_device(
    job: &HashJob,
    algorithm: HashAlgorithm,
    progress: &JobProgress,
) -> Result<DigestOutput, HashError> {
    let path = job.device_path.as_path();
    let file = File::open(path).map_err(|source| HashError::OpenFailed {
        path: path.to_path_buf(),
        source,
    })?;
    let total = device_size(&file).map_err(|source| HashError::OpenFailed {
        path: path.to_path_buf(),
        source,
    })?;
    progress.set_total(total);

    if job.use_mmap && total > 0 {
        match hash_mapped(path, &file, total, algorithm, progress) {
            Err(HashError::MapFailed { offset, source, .. }) => {
                warn!(
                    device = %path.display(),
                    offset,
                    error = %source,
                    "Memory mapping failed, retrying with buffered reads"
                );
                progress.set_processed(0);
            }
            other => return other,
        }
    }
    drop(file);

    hash_buffered(path, job.buffer_size, job.direct_io, algorithm, progress)
}

fn device_size(file: &File) -> io::Result<u64> {
    let meta = file.metadata()?;
    if !meta.file_type().is_block_device() {
        return Ok(meta.len());
    }

    let mut size: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes exactly one u64 through the pointer.
    match unsafe { blk_get_size64(file.as_raw_fd(), &mut size) } {
        Ok(_) => Ok(size),
        Err(errno) => {
            debug!(error = %errno, "BLKGETSIZE64 failed, seeking to end instead");
            let mut handle = file;
            let end = handle.seek(SeekFrom::End(0))?;
            handle.seek(SeekFrom::Start(0))?;
            Ok(end)
        }
    }
}

fn hash_mapped(
    path: &Path,
    file: &File,
    total: u64,
    algorithm: HashAlgorithm,
    progress: &JobProgress,
) -> Result<DigestOutput, HashError> {
    let mut digest = Digester::new(algorithm);
    let mut offset = 0u64;

    while offset < total {
        if progress.is_cancelled() {
            return Err(HashError::Cancelled);
        }

        let len = (total - offset).min(MMAP_CHUNK_SIZE) as usize;
        // SAFETY: read-only mapping of a device this process never writes. Offsets are
        // multiples of the chunk size and therefore page aligned.
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map(file) }.map_err(
            |source| HashError::MapFailed {
                path: path.to_path_buf(),
                offset,
                source,
            },
        )?;
        let _ = map.advise(Advice::Sequential);

        digest.update(&map);
        offset += len as u64;
        progress.set_processed(offset);
    }

    Ok(DigestOutput {
        hash: digest.finalize_hex(),
        bytes: offset,
    })
}

/// Clamp a requested buffer size and round it up to the direct I/O alignment.
pub fn effective_buffer_size(requested: usize) -> usize {
    let clamped = requested.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE);
    clamped.div_ceil(DIRECT_IO_ALIGN) * DIRECT_IO_ALIGN
}

fn hash_buffered(
    path: &Path,
    buffer_size: usize,
    direct_io: bool,
    algorithm: HashAlgorithm,
    progress: &JobProgress,
) -> Result<DigestOutput, HashError> {
    let buffer_size = effective_buffer_size(buffer_size);
    let mut backing = vec![0u8; buffer_size + DIRECT_IO_ALIGN];
    let start = backing.as_ptr().align_offset(DIRECT_IO_ALIGN);
    let aligned = start < DIRECT_IO_ALIGN;
    let start = if aligned { start } else { 0 };
    let buf = &mut backing[start..start + buffer_size];

    let (mut file, mut direct) = open_for_read(path, direct_io && aligned)?;
    let mut digest = Digester::new(algorithm);
    let mut processed = 0u64;

    loop {
        if progress.is_cancelled() {
            return Err(HashError::Cancelled);
        }

        match file.read(buf) {
            Ok(0) => break,
            Ok(n) => {
                digest.update(&buf[..n]);
                processed += n as u64;
                progress.set_processed(processed);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if direct && e.raw_os_error() == Some(libc::EINVAL) => {
                debug!(
                    device = %path.display(),
                    offset = processed,
                    "Direct I/O rejected, continuing with cached reads"
                );
                let (reopened, _) = open_for_read(path, false)?;
                file = reopened;
                file.seek(SeekFrom::Start(processed))
                    .map_err(|source| HashError::ReadFailed {
                        path: path.to_path_buf(),
                        offset: processed,
                        source,
                    })?;
                direct = false;
            }
            Err(source) => {
                return Err(HashError::ReadFailed {
                    path: path.to_path_buf(),
                    offset: processed,
                    source,
                });
            }
        }
    }

    Ok(DigestOutput {
        hash: digest.finalize_hex(),
        bytes: processed,
    })
}

fn open_for_read(path: &Path, direct: bool) -> Result<(File, bool), HashError> {
    if direct {
        match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)
        {
            Ok(file) => return Ok((file, true)),
            Err(e) => debug!(device = %path.display(), error = %e, "O_DIRECT unavailable"),
        }
    }

    File::open(path)
        .map(|file| (file, false))
        .map_err(|source| HashError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn image(len: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    fn job(path: PathBuf, buffer_size: usize, use_mmap: bool, direct_io: bool) -> HashJob {
        HashJob {
            device_path: path,
            algorithm: "SHA256".to_string(),
            buffer_size,
            use_mmap,
            direct_io,
        }
    }

    #[test]
    fn test_buffer_size_is_clamped_and_aligned() {
        assert_eq!(effective_buffer_size(1), MIN_BUFFER_SIZE);
        assert_eq!(effective_buffer_size(usize::MAX), MAX_BUFFER_SIZE);
        assert_eq!(effective_buffer_size(100 * 1024), 100 * 1024);
        assert_eq!(effective_buffer_size(65 * 1024 + 1) % DIRECT_IO_ALIGN, 0);
    }

    #[test]
    fn test_read_and_mmap_paths_agree() {
        let file = image(300_001);
        let path = file.path().to_path_buf();

        let mapped = hash_device(
            &job(path.clone(), MIN_BUFFER_SIZE, true, false),
            HashAlgorithm::Sha256,
            &JobProgress::default(),
        )
        .unwrap();
        let buffered = hash_device(
            &job(path.clone(), MIN_BUFFER_SIZE, false, false),
            HashAlgorithm::Sha256,
            &JobProgress::default(),
        )
        .unwrap();
        let direct = hash_device(
            &job(path, 4 * 1024 * 1024, false, true),
            HashAlgorithm::Sha256,
            &JobProgress::default(),
        )
        .unwrap();

        assert_eq!(mapped.hash, buffered.hash);
        assert_eq!(buffered.hash, direct.hash);
        assert_eq!(mapped.bytes, 300_001);
        assert_eq!(direct.bytes, 300_001);
    }

    #[test]
    fn test_progress_reaches_total() {
        let file = image(200_000);
        let progress = JobProgress::default();
        hash_device(
            &job(file.path().to_path_buf(), MIN_BUFFER_SIZE, false, false),
            HashAlgorithm::Blake3,
            &progress,
        )
        .unwrap();
        assert_eq!(progress.total_bytes(), 200_000);
        assert_eq!(progress.bytes_processed(), 200_000);
        assert_eq!(progress.fraction(), 1.0);
    }

    #[test]
    fn test_empty_device_hashes_empty_input() {
        let file = NamedTempFile::new().unwrap();
        let progress = JobProgress::default();
        let out = hash_device(
            &job(file.path().to_path_buf(), MIN_BUFFER_SIZE, true, false),
            HashAlgorithm::Sha256,
            &progress,
        )
        .unwrap();
        assert_eq!(
            out.hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(out.bytes, 0);
        assert_eq!(progress.fraction(), 0.0);
    }

    #[test]
    fn test_cancelled_before_first_chunk() {
        let file = image(100_000);
        let progress = JobProgress::default();
        progress.cancel();
        let result = hash_device(
            &job(file.path().to_path_buf(), MIN_BUFFER_SIZE, false, false),
            HashAlgorithm::Sha256,
            &progress,
        );
        assert!(matches!(result, Err(HashError::Cancelled)));
    }

    #[test]
    fn test_missing_device_is_open_failure() {
        let result = hash_device(
            &job(PathBuf::from("/nonexistent/usbwarden-dev"), MIN_BUFFER_SIZE, false, false),
            HashAlgorithm::Sha256,
            &JobProgress::default(),
        );
        assert!(matches!(result, Err(HashError::OpenFailed { .. })));
    }
}

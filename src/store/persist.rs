//! File-level helpers: atomic replace, staging cleanup and backup rotation.

use std::fs::{self, File, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

pub const MAX_BACKUPS: usize = 5;

const STAGING_SUFFIX: &str = ".staging";

/// Replace `dest` with `bytes` so readers only ever see the old or the new file.
///
/// The payload goes to a staging file in the same directory, is synced, then
/// renamed over `dest`. Permissions are tightened to 0600 after the rename.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = parent_dir(dest);
    fs::create_dir_all(&dir)?;

    let staging_path = dir.join(staging_name(dest));
    let staged = stage(&staging_path, bytes).and_then(|_| fs::rename(&staging_path, dest));
    if let Err(e) = staged {
        let _ = fs::remove_file(&staging_path);
        return Err(e);
    }

    fs::set_permissions(dest, Permissions::from_mode(0o600))?;
    if let Err(e) = fsync_dir(&dir) {
        debug!(dir = %dir.display(), error = %e, "Directory fsync failed");
    }
    Ok(())
}

fn stage(staging_path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(staging_path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn staging_name(dest: &Path) -> String {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "whitelist".to_string());
    format!(".{file_name}.{}{STAGING_SUFFIX}", Uuid::now_v7())
}

/// Remove staging files left behind by a crash between write and rename.
pub fn cleanup_staging(dest: &Path) -> usize {
    let dir = parent_dir(dest);
    let Some(file_name) = dest.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return 0;
    };
    let prefix = format!(".{file_name}.");

    let Ok(entries) = fs::read_dir(&dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(STAGING_SUFFIX) {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %name, error = %e, "Failed to remove stale staging file"),
            }
        }
    }
    removed
}

fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn split_name(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "whitelist".to_string());
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "json".to_string());
    (stem, ext)
}

/// Default backup location next to the database:
/// `<stem>_backup_<YYYYMMDD_HHMMSS_micros>.<ext>`.
///
/// The fixed-width timestamp keeps lexicographic order chronological; a
/// numeric suffix is added on collision.
pub fn backup_path(database: &Path, now: DateTime<Utc>) -> PathBuf {
    let dir = parent_dir(database);
    let (stem, ext) = split_name(database);
    let stamp = now.format("%Y%m%d_%H%M%S_%6f");

    let candidate = dir.join(format!("{stem}_backup_{stamp}.{ext}"));
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|n| dir.join(format!("{stem}_backup_{stamp}_{n}.{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Backups of `database` in `dir`, oldest first.
pub fn list_backups(database: &Path, dir: &Path) -> Vec<PathBuf> {
    let (stem, ext) = split_name(database);
    let prefix = format!("{stem}_backup_");
    let suffix = format!(".{ext}");

    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut backups: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.starts_with(&prefix) && name.ends_with(&suffix)
        })
        .map(|entry| entry.path())
        .collect();
    backups.sort();
    backups
}

/// Delete the oldest backups in `dir` until at most [`MAX_BACKUPS`] remain.
pub fn rotate_backups(database: &Path, dir: &Path) -> Vec<PathBuf> {
    let backups = list_backups(database, dir);
    let excess = backups.len().saturating_sub(MAX_BACKUPS);

    let mut removed = Vec::new();
    for old in backups.into_iter().take(excess) {
        match fs::remove_file(&old) {
            Ok(()) => {
                debug!(backup = %old.display(), "Removed old backup");
                removed.push(old);
            }
            Err(e) => warn!(backup = %old.display(), error = %e, "Failed to remove old backup"),
        }
    }
    removed
}

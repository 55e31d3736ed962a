//! Error types shared across the watcher, hasher, store and mount layers.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::models::DeviceIdentity;

/// Failures while talking to udev or reading device attributes.
#[derive(Debug, Error)]
pub enum DeviceAccessError {
    #[error("failed to open udev monitor: {0}")]
    MonitorInit(#[source] io::Error),

    #[error("failed to enumerate block devices: {0}")]
    Enumerate(#[source] io::Error),

    #[error("device {path} skipped: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum HashError {
    #[error("cannot open {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("read error on {path} at offset {offset}: {source}")]
    ReadFailed {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("cannot map {path} at offset {offset}: {source}")]
    MapFailed {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("hash cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to parse whitelist {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("backup {path} failed: {source}")]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize whitelist: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("device {0} is already whitelisted")]
    DuplicateDevice(DeviceIdentity),

    #[error("device {0} is not whitelisted")]
    UnknownDevice(DeviceIdentity),
}

/// Errors reported by the disk-management service. `Display` is the text shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MountError {
    #[error("Permission denied. You may need to authenticate.")]
    NotAuthorized,

    #[error("Device is already mounted.")]
    AlreadyMounted,

    #[error("Device is not mounted.")]
    NotMounted,

    #[error("Device is busy. Please close any open files or applications using this device.")]
    Busy,

    #[error("No recognizable filesystem found on device.")]
    NoFilesystem,

    #[error("{0}")]
    Service(String),

    #[error("failed to run disk service client: {0}")]
    Spawn(String),
}

impl MountError {
    /// Classify a raw error message from the disk service.
    pub fn from_service_message(message: &str) -> Self {
        let trimmed = message.trim();
        let lower = trimmed.to_ascii_lowercase();

        if lower.contains("notauthorized") || lower.contains("not authorized") {
            Self::NotAuthorized
        } else if lower.contains("alreadymounted") || lower.contains("already mounted") {
            Self::AlreadyMounted
        } else if lower.contains("notmounted") || lower.contains("not mounted") {
            Self::NotMounted
        } else if lower.contains("devicebusy") || lower.contains("busy") {
            Self::Busy
        } else if lower.contains("nofilesystem")
            || lower.contains("no filesystem")
            || lower.contains("wrong fs type")
        {
            Self::NoFilesystem
        } else {
            Self::Service(trimmed.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translates_udisks_errors() {
        let cases = [
            (
                "Error mounting /dev/sdb1: GDBus.Error:org.freedesktop.UDisks2.Error.NotAuthorizedCanObtain: Not authorized to perform operation",
                MountError::NotAuthorized,
            ),
            (
                "GDBus.Error:org.freedesktop.UDisks2.Error.AlreadyMounted: Device /dev/sdb1 is already mounted at `/media/x'",
                MountError::AlreadyMounted,
            ),
            (
                "GDBus.Error:org.freedesktop.UDisks2.Error.NotMounted: Device `/dev/sdb1' is not mounted",
                MountError::NotMounted,
            ),
            (
                "GDBus.Error:org.freedesktop.UDisks2.Error.DeviceBusy: target is busy",
                MountError::Busy,
            ),
            (
                "Object /org/freedesktop/UDisks2/block_devices/sdb is not a mountable filesystem (no filesystem)",
                MountError::NoFilesystem,
            ),
        ];

        for (message, expected) in cases {
            assert_eq!(MountError::from_service_message(message), expected, "{message}");
        }
    }

    #[test]
    fn test_unknown_errors_pass_through() {
        let err = MountError::from_service_message("  something odd happened\n");
        assert_eq!(err, MountError::Service("something odd happened".into()));
        assert_eq!(err.to_string(), "something odd happened");
    }

    #[test]
    fn test_user_facing_text() {
        assert_eq!(
            MountError::Busy.to_string(),
            "Device is busy. Please close any open files or applications using this device."
        );
        assert_eq!(
            MountError::NotAuthorized.to_string(),
            "Permission denied. You may need to authenticate."
        );
    }
}

//! Interface to the external disk-management service, plus mount table parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MountError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    pub read_only: bool,
    pub no_exec: bool,
    pub no_suid: bool,
    pub sync: bool,
    pub extra_options: Vec<String>,
    pub filesystem: Option<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            no_exec: true,
            no_suid: true,
            sync: false,
            extra_options: Vec::new(),
            filesystem: None,
        }
    }
}

impl MountOptions {
    /// Comma-separated `-o` argument.
    pub fn option_string(&self) -> String {
        let mut opts: Vec<String> = Vec::new();
        if self.read_only {
            opts.push("ro".into());
        }
        if self.no_exec {
            opts.push("noexec".into());
        }
        if self.no_suid {
            opts.push("nosuid".into());
        }
        if self.sync {
            opts.push("sync".into());
        }
        opts.extend(
            self.extra_options
                .iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty()),
        );
        opts.join(",")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnmountOptions {
    pub force: bool,
    pub lazy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountEvent {
    MountCompleted {
        path: PathBuf,
        mount_point: Option<PathBuf>,
        success: bool,
        error: Option<String>,
    },
    UnmountCompleted {
        path: PathBuf,
        success: bool,
        error: Option<String>,
    },
    PowerOffCompleted {
        path: PathBuf,
        success: bool,
        error: Option<String>,
    },
}

#[async_trait]
pub trait MountService: Send + Sync {
    /// Mount a partition and return its mount point.
    async fn mount(&self, device: &Path, options: &MountOptions) -> Result<PathBuf, MountError>;

    async fn unmount(&self, device: &Path, options: &UnmountOptions) -> Result<(), MountError>;

    /// Power off the drive backing `device` so it can be removed safely.
    async fn power_off(&self, device: &Path) -> Result<(), MountError>;
}

/// Device node to mount point, as read from `/proc/mounts`.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: HashMap<PathBuf, PathBuf>,
}

impl MountTable {
    pub const PROC_MOUNTS: &'static str = "/proc/mounts";

    /// Read the live table. An unreadable table is treated as empty.
    pub fn load() -> Self {
        match std::fs::read_to_string(Self::PROC_MOUNTS) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read mount table");
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Self {
        let mut entries = HashMap::new();
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let (Some(source), Some(target)) = (fields.next(), fields.next()) else {
                continue;
            };
            if !source.starts_with("/dev/") {
                continue;
            }
            // First mount wins, matching what most tools report for bind mounts.
            entries
                .entry(PathBuf::from(unescape(source)))
                .or_insert_with(|| PathBuf::from(unescape(target)));
        }
        Self { entries }
    }

    pub fn mount_point(&self, device: &Path) -> Option<PathBuf> {
        self.entries.get(device).cloned()
    }
}

/// Decode the octal escapes the kernel uses for whitespace and backslashes.
fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(idx) = rest.find('\\') {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx + 1..];
        let decoded = match tail.get(..3) {
            Some("040") => Some(' '),
            Some("011") => Some('\t'),
            Some("012") => Some('\n'),
            Some("134") => Some('\\'),
            _ => None,
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[3..];
            }
            None => {
                out.push('\\');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

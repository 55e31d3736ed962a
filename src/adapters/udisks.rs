//! Mount service backed by the `udisksctl` client.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::core::mount::{MountOptions, MountService, UnmountOptions};
use crate::error::MountError;

const UDISKSCTL: &str = "udisksctl";

#[derive(Debug, Clone)]
pub struct UdisksMounter {
    program: PathBuf,
}

impl Default for UdisksMounter {
    fn default() -> Self {
        Self::new()
    }
}

impl UdisksMounter {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from(UDISKSCTL),
        }
    }

    /// Use a specific client binary instead of the one on `PATH`.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<String, MountError> {
        debug!(program = %self.program.display(), ?args, "Running disk service client");
        let output: Output = Command::new(&self.program)
            .args(&args)
            .arg("--no-user-interaction")
            .output()
            .await
            .map_err(|e| MountError::Spawn(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            stdout.as_str()
        } else {
            stderr.as_ref()
        };
        Err(MountError::from_service_message(message))
    }
}

fn mount_args(device: &Path, options: &MountOptions) -> Vec<String> {
    let mut args = vec![
        "mount".to_string(),
        "-b".to_string(),
        device.display().to_string(),
    ];
    let opts = options.option_string();
    if !opts.is_empty() {
        args.push("-o".to_string());
        args.push(opts);
    }
    if let Some(fs) = options.filesystem.as_deref().filter(|fs| !fs.is_empty()) {
        args.push("-t".to_string());
        args.push(fs.to_string());
    }
    args
}

fn unmount_args(device: &Path, options: &UnmountOptions) -> Vec<String> {
    let mut args = vec![
        "unmount".to_string(),
        "-b".to_string(),
        device.display().to_string(),
    ];
    if options.force || options.lazy {
        args.push("--force".to_string());
    }
    args
}

/// Extract the mount point from `Mounted /dev/sdb1 at /media/user/LABEL.`
fn parse_mount_point(output: &str) -> Option<PathBuf> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Mounted ")?;
        let (_, mount_point) = rest.split_once(" at ")?;
        let mount_point = mount_point.trim().trim_end_matches('.');
        (!mount_point.is_empty()).then(|| PathBuf::from(mount_point))
    })
}

#[async_trait]
impl MountService for UdisksMounter {
    async fn mount(&self, device: &Path, options: &MountOptions) -> Result<PathBuf, MountError> {
        let stdout = self.run(mount_args(device, options)).await?;
        let mount_point = parse_mount_point(&stdout)
            .ok_or_else(|| MountError::Service(format!("unexpected output: {}", stdout.trim())))?;
        info!(device = %device.display(), mount_point = %mount_point.display(), "Mounted");
        Ok(mount_point)
    }

    async fn unmount(&self, device: &Path, options: &UnmountOptions) -> Result<(), MountError> {
        self.run(unmount_args(device, options)).await?;
        Ok(())
    }

    async fn power_off(&self, device: &Path) -> Result<(), MountError> {
        self.run(vec![
            "power-off".to_string(),
            "-b".to_string(),
            device.display().to_string(),
        ])
        .await?;
        Ok(())
    }
}

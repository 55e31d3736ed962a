//! Decisions that need a human: admitting a new device and accepting a changed hash.

use async_trait::async_trait;
use tracing::warn;

use super::models::DeviceSnapshot;
use crate::console::Console;

#[async_trait]
pub trait ConfirmationPolicy: Send + Sync {
    /// Whether an unknown device may be whitelisted.
    async fn confirm_new_device(&self, device: &DeviceSnapshot) -> bool;

    /// Whether `actual` should replace `expected` as the device's baseline.
    async fn accept_modified(&self, device: &DeviceSnapshot, expected: &str, actual: &str) -> bool;
}

/// Accepts everything. Suitable for unattended setups and tests.
pub struct AutoApprove;

#[async_trait]
impl ConfirmationPolicy for AutoApprove {
    async fn confirm_new_device(&self, _device: &DeviceSnapshot) -> bool {
        true
    }

    async fn accept_modified(&self, _device: &DeviceSnapshot, _expected: &str, _actual: &str) -> bool {
        true
    }
}

/// Refuses everything.
pub struct AlwaysDeny;

#[async_trait]
impl ConfirmationPolicy for AlwaysDeny {
    async fn confirm_new_device(&self, _device: &DeviceSnapshot) -> bool {
        false
    }

    async fn accept_modified(&self, _device: &DeviceSnapshot, _expected: &str, _actual: &str) -> bool {
        false
    }
}

/// Asks on the console shared with the daemon's command input.
pub struct TerminalPrompt {
    console: Console,
}

impl TerminalPrompt {
    pub fn new(console: Console) -> Self {
        Self { console }
    }

    async fn ask(&self, question: String) -> bool {
        match self.console.ask(&question).await {
            Some(line) => parse_yes(&line),
            None => {
                warn!("Console input closed, treating as no");
                false
            }
        }
    }
}

#[async_trait]
impl ConfirmationPolicy for TerminalPrompt {
    async fn confirm_new_device(&self, device: &DeviceSnapshot) -> bool {
        self.ask(format!(
            "New USB device {} ({}, {} bytes). Add to whitelist?",
            device.display_name(),
            device.identity(),
            device.size_bytes
        ))
        .await
    }

    async fn accept_modified(&self, device: &DeviceSnapshot, expected: &str, actual: &str) -> bool {
        self.ask(format!(
            "Device {} changed since last verification.\n  expected {expected}\n  actual   {actual}\nAccept the new contents as baseline?",
            device.display_name()
        ))
        .await
    }
}

fn parse_yes(input: &str) -> bool {
    matches!(input.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

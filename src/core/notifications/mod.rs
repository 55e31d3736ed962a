mod slack;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{NotificationChannelType, NotificationConfig};
use crate::core::models::DeviceIdentity;

/// Events that trigger notifications
#[derive(Debug, Clone)]
pub enum AlertEvent {
    NewDevice {
        identity: DeviceIdentity,
        device_label: String,
        device_node: PathBuf,
        size_bytes: u64,
    },
    Modified {
        identity: DeviceIdentity,
        device_label: String,
        expected: String,
        actual: String,
        action: ModifiedAction,
    },
    HashFailed {
        identity: DeviceIdentity,
        device_label: String,
        error: String,
    },
}

/// What the daemon does with a device whose hash no longer matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifiedAction {
    /// Eject was requested before the mismatch was found.
    Ejecting,
    Blocked,
    AwaitingDecision,
    /// Mounted anyway; the stored baseline is left as it was.
    MountedWithoutRebaseline,
    NoAction,
}

impl fmt::Display for ModifiedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModifiedAction::Ejecting => "Ejecting device",
            ModifiedAction::Blocked => "Mount blocked",
            ModifiedAction::AwaitingDecision => "Awaiting decision",
            ModifiedAction::MountedWithoutRebaseline => "Mounted, baseline unchanged",
            ModifiedAction::NoAction => "No action taken",
        })
    }
}

/// Trait for notification channel implementations (Slack, Discord, etc.)
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, event: AlertEvent) -> Result<()>;
}

/// Factory function to create a notifier based on config
pub fn create_notifier(config: &NotificationConfig) -> Option<Arc<dyn NotificationChannel>> {
    match &config.channel {
        NotificationChannelType::None => None,
        NotificationChannelType::Slack => {
            let webhook = config.slack_webhook.as_ref()?;
            if webhook.is_empty() {
                return None;
            }
            Some(Arc::new(slack::SlackNotifier::new(webhook.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifier_requires_webhook() {
        assert!(create_notifier(&NotificationConfig::default()).is_none());

        let mut config = NotificationConfig {
            channel: NotificationChannelType::Slack,
            slack_webhook: Some(String::new()),
        };
        assert!(create_notifier(&config).is_none());

        config.slack_webhook = Some("https://hooks.slack.com/services/T/B/X".into());
        assert!(create_notifier(&config).is_some());
    }
}

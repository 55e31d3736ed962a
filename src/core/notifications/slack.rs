use super::{AlertEvent, NotificationChannel};
use crate::store::short_hash;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, event: &AlertEvent) -> serde_json::Value {
        match event {
            AlertEvent::NewDevice {
                identity,
                device_label,
                device_node,
                size_bytes,
            } => {
                let size_mb = *size_bytes as f64 / (1024.0 * 1024.0);
                json!({
                    "blocks": [
                        {
                            "type": "header",
                            "text": {
                                "type": "plain_text",
                                "text": "New USB Device",
                                "emoji": true
                            }
                        },
                        {
                            "type": "section",
                            "fields": [
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Device:*\n{}", device_label)
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Identity:*\n`{}`", identity)
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Node:*\n`{}`", device_node.display())
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Size:*\n{:.1} MB", size_mb)
                                }
                            ]
                        }
                    ]
                })
            }
            AlertEvent::Modified {
                identity,
                device_label,
                expected,
                actual,
                action,
            } => {
                json!({
                    "blocks": [
                        {
                            "type": "header",
                            "text": {
                                "type": "plain_text",
                                "text": "USB Device Modified",
                                "emoji": true
                            }
                        },
                        {
                            "type": "section",
                            "fields": [
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Device:*\n{}", device_label)
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Identity:*\n`{}`", identity)
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Expected:*\n`{}…`", short_hash(expected))
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Actual:*\n`{}…`", short_hash(actual))
                                }
                            ]
                        },
                        {
                            "type": "section",
                            "text": {
                                "type": "mrkdwn",
                                "text": format!("*Action:* {}", action)
                            }
                        }
                    ]
                })
            }
            AlertEvent::HashFailed {
                identity,
                device_label,
                error,
            } => {
                json!({
                    "blocks": [
                        {
                            "type": "header",
                            "text": {
                                "type": "plain_text",
                                "text": "Verification Failed",
                                "emoji": true
                            }
                        },
                        {
                            "type": "section",
                            "fields": [
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Device:*\n{}", device_label)
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Identity:*\n`{}`", identity)
                                }
                            ]
                        },
                        {
                            "type": "section",
                            "text": {
                                "type": "mrkdwn",
                                "text": format!("*Error:*\n```{}```", error)
                            }
                        }
                    ]
                })
            }
        }
    }
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn notify(&self, event: AlertEvent) -> Result<()> {
        let payload = self.format_message(&event);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::DeviceIdentity;
    use crate::core::notifications::ModifiedAction;

    #[test]
    fn test_modified_message_truncates_hashes() {
        let notifier = SlackNotifier::new("https://example.invalid".into());
        let payload = notifier.format_message(&AlertEvent::Modified {
            identity: DeviceIdentity::from("S1_Kingston_DT"),
            device_label: "BACKUP".into(),
            expected: "a".repeat(64),
            actual: "b".repeat(64),
            action: ModifiedAction::Blocked,
        });

        let fields = &payload["blocks"][1]["fields"];
        assert_eq!(fields[2]["text"], format!("*Expected:*\n`{}…`", "a".repeat(16)));
        assert_eq!(payload["blocks"][2]["text"]["text"], "*Action:* Mount blocked");
    }

    #[test]
    fn test_modified_message_reports_mount_without_rebaseline() {
        let notifier = SlackNotifier::new("https://example.invalid".into());
        let payload = notifier.format_message(&AlertEvent::Modified {
            identity: DeviceIdentity::from("S1_Kingston_DT"),
            device_label: "BACKUP".into(),
            expected: "a".repeat(64),
            actual: "b".repeat(64),
            action: ModifiedAction::MountedWithoutRebaseline,
        });
        assert_eq!(
            payload["blocks"][2]["text"]["text"],
            "*Action:* Mounted, baseline unchanged"
        );
    }

    #[test]
    fn test_modified_message_with_non_ascii_hashes() {
        let notifier = SlackNotifier::new("https://example.invalid".into());
        let payload = notifier.format_message(&AlertEvent::Modified {
            identity: DeviceIdentity::from("S1_Kingston_DT"),
            device_label: "BACKUP".into(),
            expected: "ä".repeat(40),
            actual: "abc".into(),
            action: ModifiedAction::NoAction,
        });
        let fields = &payload["blocks"][1]["fields"];
        assert_eq!(fields[2]["text"], format!("*Expected:*\n`{}…`", "ä".repeat(16)));
        assert_eq!(fields[3]["text"], "*Actual:*\n`abc…`");
    }
}

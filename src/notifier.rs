//! Outbound notifications to the tab/content layer.
//!
//! Delivery is fire-and-forget: `notify` never blocks the pipeline and the
//! core does not await an acknowledgement.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::tracker::{ImageRequestRecord, TabId};

/// Message sent to a tab: `{"action": "IMAGE_PROCESSED", "payload": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TabMessage {
    ImageProcessed(ImageRequestRecord),
}

pub trait Notifier: Send + Sync {
    fn notify(&self, tab_id: TabId, message: TabMessage);
}

/// A notification addressed to a tab, as carried by `ChannelNotifier`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabEnvelope {
    pub tab_id: TabId,
    pub message: TabMessage,
}

/// Forwards notifications into an in-process channel.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<TabEnvelope>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TabEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, tab_id: TabId, message: TabMessage) {
        if self.tx.send(TabEnvelope { tab_id, message }).is_err() {
            warn!(tab_id, "Failed to send notification - channel closed");
        }
    }
}

/// POSTs each notification as JSON to a fixed endpoint on a detached task.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, tab_id: TabId, message: TabMessage) {
        let client = self.client.clone();
        let url = self.url.clone();
        let envelope = TabEnvelope { tab_id, message };

        tokio::spawn(async move {
            match client.post(&url).json(&envelope).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(tab_id, "Notification delivered");
                }
                Ok(response) => {
                    warn!(tab_id, status = %response.status(), "Notification rejected");
                }
                Err(e) => {
                    warn!(tab_id, error = %e, "Notification delivery failed");
                }
            }
        });
    }
}

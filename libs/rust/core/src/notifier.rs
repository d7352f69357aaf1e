//! Best-effort alerting side-channel. A failed notification is logged and
//! swallowed; it must never block or change a promotion decision.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEvent {
    Promoted,
    Rejected,
    RolledBack,
    CommitFailed,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotifyEvent, details: &str);
}

/// Console/log notifier, the default channel.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotifyEvent, details: &str) {
        match event {
            NotifyEvent::Promoted => info!(?event, details, "promotion notification"),
            _ => warn!(?event, details, "promotion notification"),
        }
    }
}

/// Fire-and-forget JSON POST to an alerting webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        Self { client: reqwest::Client::new(), url: url.to_string() }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: NotifyEvent, details: &str) {
        let body = serde_json::json!({ "event": event, "details": details });
        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), ?event, "webhook notification not accepted"),
            Err(e) => warn!(error = %e, ?event, "webhook notification failed"),
        }
    }
}

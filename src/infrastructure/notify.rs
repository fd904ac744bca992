//! Lifecycle event sinks
//!
//! Notifications fire after a transition commits, never inside it, so a slow
//! or broken sink cannot poison state changes. Senders log failures and move
//! on; there is no delivery guarantee.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Kinds of lifecycle events emitted by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    BatchStart,
    BatchComplete,
    BatchFailed,
    DeployStart,
    DeploySuccess,
    DeployFailed,
    StateTransition,
}

impl NotifyKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BatchStart => "batch_start",
            Self::BatchComplete => "batch_complete",
            Self::BatchFailed => "batch_failed",
            Self::DeployStart => "deploy_start",
            Self::DeploySuccess => "deploy_success",
            Self::DeployFailed => "deploy_failed",
            Self::StateTransition => "state_transition",
        }
    }
}

/// Post-commit event sink
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, kind: NotifyKind, payload: serde_json::Value);
}

/// Sink that drops everything; used when no webhook is configured
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl NotificationSink for NoopSink {
    async fn send(&self, kind: NotifyKind, _payload: serde_json::Value) {
        debug!("Dropping {} notification (no sink configured)", kind.as_str());
    }
}

/// Event envelope posted to the webhook
#[derive(Debug, Serialize)]
struct Event<'a> {
    event_id: Uuid,
    kind: &'a str,
    occurred_at: chrono::DateTime<chrono::Utc>,
    payload: &'a serde_json::Value,
}

/// Webhook sink posting JSON events to a configured URL
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client with static options");
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, kind: NotifyKind, payload: serde_json::Value) {
        let event = Event {
            event_id: Uuid::new_v4(),
            kind: kind.as_str(),
            occurred_at: chrono::Utc::now(),
            payload: &payload,
        };
        match self.client.post(&self.url).json(&event).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(
                    "Notification {} rejected by {} with status {}",
                    kind.as_str(),
                    self.url,
                    response.status()
                );
            }
            Err(e) => {
                warn!("Failed to deliver {} notification: {e}", kind.as_str());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records events for assertions
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<(NotifyKind, serde_json::Value)>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn send(&self, kind: NotifyKind, payload: serde_json::Value) {
            self.events.lock().unwrap().push((kind, payload));
        }
    }

    #[tokio::test]
    async fn noop_sink_swallows_events() {
        NoopSink.send(NotifyKind::BatchStart, serde_json::json!({})).await;
    }

    #[tokio::test]
    async fn recording_sink_keeps_order() {
        let sink = RecordingSink::default();
        sink.send(NotifyKind::DeployStart, serde_json::json!({"id": 1}))
            .await;
        sink.send(NotifyKind::DeploySuccess, serde_json::json!({"id": 1}))
            .await;
        let events = sink.events.lock().unwrap();
        assert_eq!(events[0].0, NotifyKind::DeployStart);
        assert_eq!(events[1].0, NotifyKind::DeploySuccess);
    }
}

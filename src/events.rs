//! In-process event bus
//!
//! Fire-and-forget notifications about connection activity. Publishing never blocks
//! and never fails the caller; with no subscribers the event is simply dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::ConnectionStatus;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntegrationEvent {
    WebhookReceived {
        provider: String,
        event_type: String,
        connection_id: Option<Uuid>,
        event_id: Option<String>,
        received_at: DateTime<Utc>,
    },
    ConnectionStatusChanged {
        connection_id: Uuid,
        workspace_id: Uuid,
        provider: String,
        status: ConnectionStatus,
        reason: Option<String>,
    },
    /// A connection has been in ERROR longer than the critical threshold.
    HealthCritical {
        connection_id: Uuid,
        workspace_id: Uuid,
        provider: String,
        error_since: DateTime<Utc>,
        last_error: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<IntegrationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: IntegrationEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IntegrationEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::default();
        bus.publish(IntegrationEvent::WebhookReceived {
            provider: "sandbox".to_string(),
            event_type: "dropped".to_string(),
            connection_id: None,
            event_id: None,
            received_at: Utc::now(),
        });

        let mut rx = bus.subscribe();
        let event = IntegrationEvent::ConnectionStatusChanged {
            connection_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            provider: "sandbox".to_string(),
            status: ConnectionStatus::Error,
            reason: Some("probe failed".to_string()),
        };
        bus.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "connection_status_changed");
        assert_eq!(json["status"], "error");
    }
}

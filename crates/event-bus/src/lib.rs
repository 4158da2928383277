//! Unidirectional push of execution state changes to subscribers (UI feed,
//! notification adapters). Delivery is best-effort at-least-once over the
//! subscription's lifetime, with silent drop on subscriber backpressure —
//! the same shape as the workspace's existing multi-channel notification
//! fan-out, generalized from alert types to execution-lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use notification_service::{Alert, AlertType, NotificationService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionUpdate,
    ExecutionLog,
    ExecutionComplete,
    ApprovalRequested,
    PositionClosed,
    MonitoringStalled,
    PipelineFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub execution_id: Uuid,
    pub user_id: Uuid,
    pub at: DateTime<Utc>,
    pub payload: Value,
}

impl Event {
    pub fn new(event_type: EventType, execution_id: Uuid, user_id: Uuid, payload: Value) -> Self {
        Self {
            event_type,
            execution_id,
            user_id,
            at: Utc::now(),
            payload,
        }
    }
}

const CHANNEL_CAPACITY: usize = 1024;

/// Fan-out hub: one broadcast channel per process. Websocket handlers and
/// the notification relay both subscribe; a slow or absent subscriber never
/// blocks a publisher (broadcast drops oldest on lag, per tokio semantics).
pub struct EventBus {
    sender: tokio::sync::broadcast::Sender<Event>,
    notifications: Option<Arc<NotificationService>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = tokio::sync::broadcast::channel(CHANNEL_CAPACITY);
        Self { sender, notifications: None }
    }

    pub fn with_notifications(notifications: Arc<NotificationService>) -> Self {
        let (sender, _receiver) = tokio::sync::broadcast::channel(CHANNEL_CAPACITY);
        Self { sender, notifications: Some(notifications) }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publishes to every subscriber; also relays the event types that have
    /// an obvious external-notification analogue (`position_closed`,
    /// `monitoring_stalled`, `pipeline_failed`) through the notification
    /// service, fire-and-forget.
    pub fn publish(&self, event: Event) {
        let relay = match event.event_type {
            EventType::PositionClosed => Some(AlertType::TradeExecuted {
                symbol: event.payload.get("symbol").and_then(Value::as_str).unwrap_or_default().to_string(),
                action: "close".to_string(),
                shares: 0.0,
                price: event.payload.get("exit_price").and_then(Value::as_f64).unwrap_or(0.0),
                confidence: None,
            }),
            EventType::MonitoringStalled => Some(AlertType::CircuitBreakerTripped {
                reason: format!("monitoring stalled for execution {}", event.execution_id),
            }),
            EventType::PipelineFailed => Some(AlertType::CircuitBreakerTripped {
                reason: event.payload.get("error_message").and_then(Value::as_str).unwrap_or("pipeline failed").to_string(),
            }),
            _ => None,
        };

        if let (Some(alert_type), Some(notifications)) = (relay, &self.notifications) {
            let title = format!("{:?}", event.event_type);
            let message = event.payload.to_string();
            notifications.send_alert(Alert::new(alert_type, title, message));
        }

        // Broadcast send fails only when there are zero subscribers, which is
        // an expected and harmless condition (nobody is watching right now).
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let execution_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        bus.publish(Event::new(EventType::ExecutionUpdate, execution_id, user_id, serde_json::json!({})));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.execution_id, execution_id);
        assert_eq!(received.event_type, EventType::ExecutionUpdate);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::new(EventType::ExecutionLog, Uuid::new_v4(), Uuid::new_v4(), serde_json::json!({})));
    }
}

//! Side-channel events published during generation.
//!
//! The bus itself is a collaborator owned by the host application; the core
//! only depends on the fire-and-forget `EventBus` trait. `ChannelEventBus`
//! is provided for hosts (and tests) that want to consume events over an
//! mpsc channel, `NullEventBus` for hosts that don't care.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Topic for produced text and thinking traces.
pub const TOPIC_NOTIFICATION: &str = "llm.notification";
/// Topic for per-turn token usage.
pub const TOPIC_TOKEN_COUNT: &str = "llm.token-count";

/// Content type marker for thinking-trace notifications.
pub const CONTENT_TYPE_THOUGHT: &str = "thought";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub message: String,
    /// Empty/absent for plain text, "thought" for thinking traces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl NotificationEvent {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            content_type: None,
        }
    }

    pub fn thought(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            content_type: Some(CONTENT_TYPE_THOUGHT.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCountEvent {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Notification(NotificationEvent),
    TokenCount(TokenCountEvent),
}

/// Fire-and-forget publisher by topic string. Publishing must never block
/// or fail the calling generation path.
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, event: Event);
}

/// Bus that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn publish(&self, _topic: &str, _event: Event) {}
}

/// Bus backed by an unbounded mpsc channel.
pub struct ChannelEventBus {
    tx: mpsc::UnboundedSender<(String, Event)>,
}

impl ChannelEventBus {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Event)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventBus for ChannelEventBus {
    fn publish(&self, topic: &str, event: Event) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send((topic.to_string(), event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_bus_delivers_in_order() {
        let (bus, mut rx) = ChannelEventBus::new();
        bus.publish(
            TOPIC_TOKEN_COUNT,
            Event::TokenCount(TokenCountEvent {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
            }),
        );
        bus.publish(
            TOPIC_NOTIFICATION,
            Event::Notification(NotificationEvent::text("hello")),
        );

        let (topic, event) = rx.try_recv().unwrap();
        assert_eq!(topic, TOPIC_TOKEN_COUNT);
        assert!(matches!(event, Event::TokenCount(t) if t.total_tokens == 15));

        let (topic, event) = rx.try_recv().unwrap();
        assert_eq!(topic, TOPIC_NOTIFICATION);
        assert!(matches!(event, Event::Notification(n) if n.message == "hello"));
    }

    #[test]
    fn test_publish_after_receiver_dropped_is_silent() {
        let (bus, rx) = ChannelEventBus::new();
        drop(rx);
        bus.publish(
            TOPIC_NOTIFICATION,
            Event::Notification(NotificationEvent::text("nobody home")),
        );
    }

    #[test]
    fn test_thought_content_type() {
        let event = NotificationEvent::thought("considering options");
        assert_eq!(event.content_type.as_deref(), Some("thought"));
        let plain = NotificationEvent::text("done");
        assert!(plain.content_type.is_none());
    }
}

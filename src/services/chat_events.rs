//! In-process event bus for UI observers.
//!
//! `publish` fans out synchronously, in subscription order, over a snapshot of
//! the subscriber list, so handlers may subscribe or unsubscribe (themselves or
//! others) while an event is being delivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::chat_types::{ConversationId, DeviceId, MessageId, MessageStatus};
use crate::error::{ChatError, ErrorKind};

/// Structured error attached to failure events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl From<&ChatError> for EventError {
    fn from(e: &ChatError) -> Self {
        Self {
            kind: e.kind(),
            detail: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExpireReason {
    Cancelled,
    RetriesExhausted,
    /// The send failed in a way retrying cannot fix.
    Undeliverable,
    Policy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ChatEvent {
    MessagePending {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageSending {
        conversation_id: ConversationId,
        message_id: MessageId,
        attempt: u32,
    },
    MessageSent {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageDelivered {
        conversation_id: ConversationId,
        message_id: MessageId,
        at: DateTime<Utc>,
    },
    MessageRead {
        conversation_id: ConversationId,
        message_id: MessageId,
        at: DateTime<Utc>,
    },
    MessageFailed {
        conversation_id: ConversationId,
        message_id: MessageId,
        attempt: u32,
        error: EventError,
    },
    MessageExpired {
        conversation_id: ConversationId,
        message_id: MessageId,
        reason: ExpireReason,
    },
    MessageReceived {
        conversation_id: ConversationId,
        message_id: MessageId,
        sender_id: DeviceId,
    },
    ConversationCreated {
        conversation_id: ConversationId,
        peer_id: DeviceId,
    },
    ConversationRead {
        conversation_id: ConversationId,
    },
    IngestFailed {
        message_id: MessageId,
        error: EventError,
    },
}

impl ChatEvent {
    pub fn message_id(&self) -> Option<&str> {
        match self {
            ChatEvent::MessagePending { message_id, .. }
            | ChatEvent::MessageSending { message_id, .. }
            | ChatEvent::MessageSent { message_id, .. }
            | ChatEvent::MessageDelivered { message_id, .. }
            | ChatEvent::MessageRead { message_id, .. }
            | ChatEvent::MessageFailed { message_id, .. }
            | ChatEvent::MessageExpired { message_id, .. }
            | ChatEvent::MessageReceived { message_id, .. }
            | ChatEvent::IngestFailed { message_id, .. } => Some(message_id),
            ChatEvent::ConversationCreated { .. } | ChatEvent::ConversationRead { .. } => None,
        }
    }

    /// Status a message reached with this event, if it is a status transition.
    pub fn status(&self) -> Option<MessageStatus> {
        match self {
            ChatEvent::MessagePending { .. } => Some(MessageStatus::Pending),
            ChatEvent::MessageSending { .. } => Some(MessageStatus::Sending),
            ChatEvent::MessageSent { .. } => Some(MessageStatus::Sent),
            ChatEvent::MessageDelivered { .. } | ChatEvent::MessageReceived { .. } => {
                Some(MessageStatus::Delivered)
            }
            ChatEvent::MessageRead { .. } => Some(MessageStatus::Read),
            ChatEvent::MessageFailed { .. } => Some(MessageStatus::Failed),
            ChatEvent::MessageExpired { .. } => Some(MessageStatus::Expired),
            _ => None,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&ChatEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: u64,
    active: Arc<AtomicBool>,
    handler: EventHandler,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Registry {
    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn remove(&self, id: u64) {
        self.subscribers().retain(|s| s.id != id);
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChatEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.registry.subscribers().push(Subscriber {
            id,
            active: active.clone(),
            handler: Arc::new(handler),
        });
        Subscription {
            id,
            active,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn publish(&self, event: ChatEvent) {
        let snapshot: Vec<Subscriber> = self.registry.subscribers().clone();
        for subscriber in snapshot {
            if !subscriber.active.load(Ordering::Acquire) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::warn!("Event subscriber {} failed: {:#}", subscriber.id, e);
                }
                Err(_) => {
                    log::error!("Event subscriber {} panicked", subscriber.id);
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers().len()
    }
}

/// Capability returned by `subscribe`. Dropping it keeps the subscription.
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::Release);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(id: &str) -> ChatEvent {
        ChatEvent::ConversationCreated {
            conversation_id: id.to_string(),
            peer_id: "peer".to_string(),
        }
    }

    type BoxedHandler = Box<dyn Fn(&ChatEvent) -> anyhow::Result<()> + Send + Sync>;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> BoxedHandler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for = log.clone();
        let make = move |name: &str| {
            let log = log_for.clone();
            let name = name.to_string();
            Box::new(move |_: &ChatEvent| {
                log.lock().unwrap().push(name.clone());
                Ok(())
            }) as BoxedHandler
        };
        (log, make)
    }

    #[test]
    fn test_fan_out_in_subscription_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let _a = bus.subscribe(make("a"));
        let _b = bus.subscribe(make("b"));
        let _c = bus.subscribe(make("c"));

        bus.publish(created("c1"));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_failing_and_panicking_handlers_are_isolated() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let _a = bus.subscribe(|_| Err(anyhow::anyhow!("ui detached")));
        let _b = bus.subscribe(|_| panic!("handler bug"));
        let _c = bus.subscribe(make("c"));

        bus.publish(created("c1"));
        bus.publish(created("c2"));
        assert_eq!(*log.lock().unwrap(), vec!["c", "c"]);
    }

    #[test]
    fn test_unsubscribe_self_during_publish() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let _a = bus.subscribe(make("a"));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_in_handler = slot.clone();
        let log_in_handler = log.clone();
        let sub = bus.subscribe(move |_| {
            log_in_handler.lock().unwrap().push("once".to_string());
            if let Some(me) = slot_in_handler.lock().unwrap().as_ref() {
                me.unsubscribe();
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(sub);
        let _c = bus.subscribe(make("c"));

        bus.publish(created("c1"));
        bus.publish(created("c2"));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a", "once", "c", "a", "c"],
            "others neither skipped nor doubled"
        );
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_unsubscribe_other_mid_fan_out_skips_it() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        let victim_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot = victim_slot.clone();
        let _killer = bus.subscribe(move |_| {
            if let Some(victim) = slot.lock().unwrap().take() {
                victim.unsubscribe();
            }
            Ok(())
        });
        *victim_slot.lock().unwrap() = Some(bus.subscribe(make("victim")));
        let _d = bus.subscribe(make("d"));

        bus.publish(created("c1"));
        assert_eq!(*log.lock().unwrap(), vec!["d"]);
    }

    #[test]
    fn test_subscribe_during_publish_starts_with_next_event() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let bus_in_handler = bus.clone();
        let added = Arc::new(AtomicBool::new(false));
        let make = Arc::new(make);
        let make_in_handler = make.clone();
        let _adder = bus.subscribe(move |_| {
            if !added.swap(true, Ordering::SeqCst) {
                let _late = bus_in_handler.subscribe((*make_in_handler)("late"));
            }
            Ok(())
        });

        bus.publish(created("c1"));
        assert!(log.lock().unwrap().is_empty());
        bus.publish(created("c2"));
        assert_eq!(*log.lock().unwrap(), vec!["late"]);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = ChatEvent::MessageFailed {
            conversation_id: "c1".into(),
            message_id: "m1".into(),
            attempt: 2,
            error: EventError {
                kind: ErrorKind::Timeout,
                detail: "Transport timed out after 10s".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "messageFailed");
        assert_eq!(json["messageId"], "m1");
        assert_eq!(json["error"]["kind"], "timeout");
        assert_eq!(event.status(), Some(MessageStatus::Failed));
    }
}

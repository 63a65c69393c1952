//! In-process message bus for the event engine
//!
//! This crate provides the [`MessageBus`], a topic based publish/subscribe
//! facility. Topics are hierarchical strings such as `/system/notifications/errors`.
//! Subscriptions match exactly, or by prefix with a trailing `/#`.
//!
//! Delivery is synchronous on the publisher's thread, against a snapshot of
//! the subscription list taken when `publish` starts. Subscribers of one
//! publish are called in registration order, and a subscriber sees the
//! publishes of any single thread in the order they were made.

mod topic;

pub use topic::{normalize_topic, TopicPattern, WILDCARD};

use evt_core::{Context, Message};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Errors returned by the message bus
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("invalid topic pattern '{0}'")]
    InvalidPattern(String),
}

/// Callback invoked with each delivered message
pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// A unique identifier for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    pattern: TopicPattern,
    callback: MessageCallback,
    state: Mutex<Invocations>,
    idle: Condvar,
}

/// Threads currently inside a subscription's callback
struct Invocations {
    active: bool,
    threads: Vec<ThreadId>,
}

impl Subscription {
    fn new(id: SubscriptionId, pattern: TopicPattern, callback: MessageCallback) -> Self {
        Self {
            id,
            pattern,
            callback,
            state: Mutex::new(Invocations {
                active: true,
                threads: Vec::new(),
            }),
            idle: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, Invocations> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run the callback unless the subscription was removed
    ///
    /// Returns `None` when it was not invoked, otherwise whether it returned
    /// without panicking.
    fn invoke(&self, message: &Message) -> Option<bool> {
        let me = thread::current().id();
        {
            let mut state = self.state();
            if !state.active {
                return None;
            }
            state.threads.push(me);
        }

        let result = catch_unwind(AssertUnwindSafe(|| (self.callback)(message)));

        let mut state = self.state();
        if let Some(index) = state.threads.iter().position(|t| *t == me) {
            state.threads.swap_remove(index);
        }
        self.idle.notify_all();
        Some(result.is_ok())
    }

    /// Stop further invocations and wait out those on other threads
    fn deactivate(&self) {
        let me = thread::current().id();
        let mut state = self.state();
        state.active = false;
        while state.threads.iter().any(|t| *t != me) {
            state = self.idle.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// The message bus
pub struct MessageBus {
    /// Subscriptions in registration order
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    /// Counter for generating unique subscription IDs
    next_id: AtomicU64,
}

impl MessageBus {
    /// Create a new message bus
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe a callback to a topic pattern
    pub fn subscribe<F>(&self, pattern: &str, callback: F) -> Result<SubscriptionId, BusError>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.subscribe_arc(pattern, Arc::new(callback))
    }

    /// Subscribe an already shared callback to a topic pattern
    pub fn subscribe_arc(
        &self,
        pattern: &str,
        callback: MessageCallback,
    ) -> Result<SubscriptionId, BusError> {
        let pattern = TopicPattern::new(pattern)?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        trace!(pattern = %pattern, ?id, "Subscribing");

        self.lock()
            .push(Arc::new(Subscription::new(id, pattern, callback)));
        Ok(id)
    }

    /// Subscribe to a topic pattern and receive messages on a channel
    ///
    /// Messages arrive in publish order. Dropping the receiver does not
    /// remove the subscription; call [`MessageBus::unsubscribe`] for that.
    pub fn subscribe_channel(
        &self,
        pattern: &str,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Message>), BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(pattern, move |msg: &Message| {
            // Ignore send errors - they just mean the receiver is gone
            let _ = tx.send(msg.clone());
        })?;
        Ok((id, rx))
    }

    /// Remove a subscription
    ///
    /// Idempotent: unsubscribing an unknown or already removed id is a no-op.
    /// Blocks until invocations of the callback running on other threads
    /// have returned. Once this returns, the callback is not invoked again,
    /// including by a publish already in progress. Called from inside the
    /// callback itself, the current invocation runs to completion.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut subs = self.lock();
            match subs.iter().position(|s| s.id == id) {
                Some(index) => subs.remove(index),
                None => return false,
            }
        };
        removed.deactivate();
        trace!(?id, "Unsubscribed");
        true
    }

    /// Publish a payload to a topic with a fresh context
    pub fn publish(&self, topic: &str, payload: impl Into<serde_json::Value>) -> usize {
        self.publish_message(Message::new(normalize_topic(topic), payload))
    }

    /// Publish a payload to a topic as part of an existing causality chain
    pub fn publish_with_context(
        &self,
        topic: &str,
        payload: impl Into<serde_json::Value>,
        context: Context,
    ) -> usize {
        self.publish_message(Message::new(normalize_topic(topic), payload).with_context(context))
    }

    /// Deliver a message to every matching subscription
    ///
    /// Returns the number of subscribers the message was delivered to. A
    /// panicking callback is logged and does not stop delivery to the rest.
    pub fn publish_message(&self, mut message: Message) -> usize {
        message.topic = normalize_topic(&message.topic);
        let snapshot: Vec<Arc<Subscription>> = self.lock().clone();
        debug!(topic = %message.topic, "Publishing message");

        let mut delivered = 0;
        for sub in snapshot.iter().filter(|s| s.pattern.matches(&message.topic)) {
            match sub.invoke(&message) {
                Some(true) => {}
                Some(false) => warn!(
                    topic = %message.topic,
                    pattern = %sub.pattern,
                    "Message subscriber panicked"
                ),
                None => continue,
            }
            delivered += 1;
        }
        delivered
    }

    /// Number of active subscriptions
    pub fn subscription_count(&self) -> usize {
        self.lock().len()
    }

    /// Whether any subscription matches the topic
    pub fn has_subscribers(&self, topic: &str) -> bool {
        let topic = normalize_topic(topic);
        self.lock().iter().any(|s| s.pattern.matches(&topic))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Subscription>>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for MessageBus
pub type SharedMessageBus = Arc<MessageBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::{assert_err, assert_ok};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&Message) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |msg: &Message| {
            sink.lock().unwrap().push(format!("{}={}", msg.topic, msg.payload));
        })
    }

    #[test]
    fn test_publish_exact_topic() {
        let bus = MessageBus::new();
        let (test_seen, on_test) = recorder();
        let (other_seen, on_other) = recorder();
        let test_id = bus.subscribe("/test", on_test).unwrap();
        bus.subscribe("/other", on_other).unwrap();

        assert_eq!(bus.publish("/test", "poo"), 1);
        assert_eq!(*test_seen.lock().unwrap(), vec!["/test=\"poo\"".to_string()]);
        assert!(other_seen.lock().unwrap().is_empty());

        assert!(bus.unsubscribe(test_id));
        assert_eq!(bus.publish("/test", "poo"), 0);
        assert_eq!(test_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_registration_order() {
        let bus = MessageBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..5 {
            let order = order.clone();
            bus.subscribe("/seq/#", move |_msg: &Message| order.lock().unwrap().push(n))
                .unwrap();
        }

        bus.publish("/seq/a", json!(null));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = MessageBus::new();
        let id = bus.subscribe("/x", |_msg: &Message| {}).unwrap();
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn test_subscribe_during_delivery_uses_snapshot() {
        let bus = Arc::new(MessageBus::new());
        let added = Arc::new(AtomicUsize::new(0));
        let late_calls = Arc::new(AtomicUsize::new(0));

        let bus2 = bus.clone();
        let added2 = added.clone();
        let late2 = late_calls.clone();
        bus.subscribe("/t", move |_msg: &Message| {
            let late = late2.clone();
            bus2.subscribe("/t", move |_msg: &Message| {
                late.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            added2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        bus.publish("/t", json!(1));
        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        bus.publish("/t", json!(2));
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_during_delivery_stops_later_callbacks() {
        let bus = Arc::new(MessageBus::new());
        let second_calls = Arc::new(AtomicUsize::new(0));
        let second_id = Arc::new(Mutex::new(None));

        let bus2 = bus.clone();
        let second_id2 = second_id.clone();
        bus.subscribe("/t", move |_msg: &Message| {
            if let Some(id) = *second_id2.lock().unwrap() {
                bus2.unsubscribe(id);
            }
        })
        .unwrap();

        let calls = second_calls.clone();
        let id = bus
            .subscribe("/t", move |_msg: &Message| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        *second_id.lock().unwrap() = Some(id);

        bus.publish("/t", json!(1));
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_waits_for_running_callback() {
        let bus = Arc::new(MessageBus::new());
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let entered_tx = Mutex::new(entered_tx);
        let finished = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let (f, c) = (finished.clone(), calls.clone());
        let id = bus
            .subscribe("/slow", move |_msg: &Message| {
                c.fetch_add(1, Ordering::SeqCst);
                entered_tx.lock().unwrap().send(()).unwrap();
                std::thread::sleep(std::time::Duration::from_millis(100));
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let publisher = {
            let bus = bus.clone();
            std::thread::spawn(move || bus.publish("/slow", json!(1)))
        };
        entered_rx.recv().unwrap();
        assert!(bus.unsubscribe(id));
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        assert_eq!(publisher.join().unwrap(), 1);
        assert_eq!(bus.publish("/slow", json!(2)), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_can_unsubscribe_itself() {
        let bus = Arc::new(MessageBus::new());
        let own_id = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let (bus2, own2, c) = (bus.clone(), own_id.clone(), calls.clone());
        let id = bus
            .subscribe("/once", move |_msg: &Message| {
                c.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = own2.lock().unwrap().take() {
                    assert!(bus2.unsubscribe(id));
                }
            })
            .unwrap();
        *own_id.lock().unwrap() = Some(id);

        assert_eq!(bus.publish("/once", json!(1)), 1);
        assert_eq!(bus.publish("/once", json!(2)), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let bus = MessageBus::new();
        let (seen, on_msg) = recorder();
        bus.subscribe("/t", |_msg: &Message| panic!("boom")).unwrap();
        bus.subscribe("/t", on_msg).unwrap();

        assert_eq!(bus.publish("/t", json!(1)), 2);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_pattern() {
        let bus = MessageBus::new();
        assert_err!(bus.subscribe("/a/#/b", |_msg: &Message| {}));
        assert_ok!(bus.subscribe("/a/b/#", |_msg: &Message| {}));
        assert!(bus.has_subscribers("/a/b/c"));
        assert!(!bus.has_subscribers("/a/c"));
    }

    #[tokio::test]
    async fn test_channel_subscription_preserves_order() {
        let bus = MessageBus::new();
        let (_id, mut rx) = bus.subscribe_channel("/system/#").unwrap();

        for n in 0..10 {
            bus.publish("/system/tick", json!(n));
        }
        bus.publish("/elsewhere", json!("ignored"));

        for n in 0..10 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.payload, json!(n));
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_with_context_keeps_chain() {
        let bus = MessageBus::new();
        let parent = Context::new();
        let child = parent.child();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        bus.subscribe("/t", move |msg: &Message| {
            *sink.lock().unwrap() = Some(msg.context.clone());
        })
        .unwrap();

        bus.publish_with_context("t", json!({}), child.clone());
        assert_eq!(seen.lock().unwrap().clone(), Some(child));
    }
}

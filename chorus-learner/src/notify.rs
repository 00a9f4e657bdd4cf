//! Thin publish layer over committed events.
//!
//! Subscribers register key patterns; every commit pushes matching events
//! into a bounded per-subscription buffer, drained over HTTP. Delivery is
//! best-effort at-least-once, per subscriber in slot order.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chorus_core::ClientId;
use chorus_core::messages::NotificationEvent;
use rand::Rng;
use tracing::debug;

/// Events buffered per subscription before the oldest are dropped.
const BUFFER_CAP: usize = 256;

struct Subscription {
    patterns: Vec<String>,
    queue: VecDeque<NotificationEvent>,
}

impl Subscription {
    fn matches(&self, key: &str) -> bool {
        self.patterns.iter().any(|pattern| {
            pattern
                .strip_suffix('*')
                .map_or_else(|| pattern == key, |prefix| key.starts_with(prefix))
        })
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, client: ClientId, patterns: Vec<String>) -> String {
        let id = {
            let mut rng = rand::rng();
            format!("{:016x}{:016x}", rng.random::<u64>(), rng.random::<u64>())
        };
        debug!(%client, ?patterns, subscription = %id, "subscribed");
        self.inner.lock().unwrap().insert(
            id.clone(),
            Subscription {
                patterns,
                queue: VecDeque::new(),
            },
        );
        id
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.inner.lock().unwrap().remove(id).is_some()
    }

    /// Push committed events to every matching subscription.
    pub fn publish(&self, events: &[NotificationEvent]) {
        if events.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        for subscription in inner.values_mut() {
            for event in events {
                if subscription.matches(&event.key) {
                    if subscription.queue.len() >= BUFFER_CAP {
                        subscription.queue.pop_front();
                    }
                    subscription.queue.push_back(event.clone());
                }
            }
        }
    }

    /// Drain the buffered events for a subscription.
    #[must_use]
    pub fn drain(&self, id: &str) -> Option<Vec<NotificationEvent>> {
        let mut inner = self.inner.lock().unwrap();
        let subscription = inner.get_mut(id)?;
        Some(subscription.queue.drain(..).collect())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use chorus_core::Slot;

    use super::*;

    fn event(slot: u64, key: &str) -> NotificationEvent {
        NotificationEvent {
            slot: Slot(slot),
            key: key.into(),
            value: Some("v".into()),
        }
    }

    #[test]
    fn exact_and_prefix_patterns() {
        let registry = SubscriptionRegistry::new();
        let id = registry.subscribe(
            ClientId("c".into()),
            vec!["user:*".into(), "flag".into()],
        );

        registry.publish(&[event(1, "user:7"), event(2, "flag"), event(3, "other")]);

        let events = registry.drain(&id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key, "user:7");
        assert_eq!(events[1].key, "flag");
    }

    #[test]
    fn drain_empties_the_queue() {
        let registry = SubscriptionRegistry::new();
        let id = registry.subscribe(ClientId("c".into()), vec!["*".into()]);
        registry.publish(&[event(1, "a")]);
        assert_eq!(registry.drain(&id).unwrap().len(), 1);
        assert!(registry.drain(&id).unwrap().is_empty());
    }

    #[test]
    fn unsubscribe_removes() {
        let registry = SubscriptionRegistry::new();
        let id = registry.subscribe(ClientId("c".into()), vec!["*".into()]);
        assert!(registry.unsubscribe(&id));
        assert!(!registry.unsubscribe(&id));
        assert!(registry.drain(&id).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn buffer_is_bounded() {
        let registry = SubscriptionRegistry::new();
        let id = registry.subscribe(ClientId("c".into()), vec!["*".into()]);
        for i in 0..(BUFFER_CAP as u64 + 10) {
            registry.publish(&[event(i, "k")]);
        }
        let events = registry.drain(&id).unwrap();
        assert_eq!(events.len(), BUFFER_CAP);
        // Oldest events were dropped, order preserved.
        assert_eq!(events[0].slot, Slot(10));
    }
}

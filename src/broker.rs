//! In-memory publish/subscribe for live updates.
//!
//! Every open feed (a user's notification stream or a chat thread) holds a
//! [`Subscription`] on one [`Topic`]. Server actions call
//! [`Broker::publish`] after their database writes commit. Delivery is
//! at-most-once: a subscriber whose buffer is full misses the event, and
//! nothing is replayed after a reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::models::{AssigneeStatus, NotificationKind, RequestStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    User(i64),
    Thread(i64),
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{}", id),
            Self::Thread(id) => write!(f, "thread:{}", id),
        }
    }
}

/// Events pushed to open feeds. Serialized as `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LiveEvent {
    MessagePosted {
        thread_id: i64,
        message_id: i64,
        author_id: i64,
        author_name: String,
        body: String,
        created_at: DateTime<Utc>,
        /// Time as shown in the school timezone.
        time_label: String,
    },
    ThreadCreated {
        thread_id: i64,
        title: String,
    },
    TaskAssigned {
        task_id: i64,
        title: String,
        assigned_by: String,
    },
    TaskStatusChanged {
        task_id: i64,
        assignee_id: i64,
        user_id: i64,
        status: AssigneeStatus,
    },
    NoteAdded {
        task_id: i64,
        assignee_id: i64,
        author_name: String,
        body: String,
    },
    Notification {
        id: i64,
        kind: NotificationKind,
        body: String,
        link: String,
    },
    RequestDecided {
        request_id: i64,
        status: RequestStatus,
    },
    CalendarChanged {
        event_id: i64,
        title: String,
        removed: bool,
    },
}

impl LiveEvent {
    /// SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessagePosted { .. } => "message_posted",
            Self::ThreadCreated { .. } => "thread_created",
            Self::TaskAssigned { .. } => "task_assigned",
            Self::TaskStatusChanged { .. } => "task_status_changed",
            Self::NoteAdded { .. } => "note_added",
            Self::Notification { .. } => "notification",
            Self::RequestDecided { .. } => "request_decided",
            Self::CalendarChanged { .. } => "calendar_changed",
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<LiveEvent>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<Topic, Vec<Subscriber>>,
}

impl Registry {
    fn remove(&mut self, topic: Topic, id: u64) {
        if let Some(subs) = self.topics.get_mut(&topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                self.topics.remove(&topic);
            }
        }
    }
}

/// Process-local topic → subscribers map. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    registry: Arc<Mutex<Registry>>,
    buffer: usize,
}

impl Broker {
    /// `buffer` is the per-subscriber channel capacity.
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .topics
            .entry(topic)
            .or_default()
            .push(Subscriber { id, tx });
        tracing::debug!(%topic, subscriber = id, "subscribed");
        Subscription {
            id,
            topic,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `event` to every current subscriber of `topic`, in
    /// registration order. Returns how many accepted it.
    pub fn publish(&self, topic: Topic, event: LiveEvent) -> usize {
        let mut registry = self.lock();
        let Some(subs) = registry.topics.get_mut(&topic) else {
            return 0;
        };

        let mut delivered = 0;
        subs.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::debug!(%topic, subscriber = sub.id, kind = event.kind(), "subscriber full, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if subs.is_empty() {
            registry.topics.remove(&topic);
        }
        delivered
    }

    /// Publish the same event to several users' feeds.
    pub fn publish_to_users(&self, user_ids: &[i64], event: &LiveEvent) -> usize {
        user_ids
            .iter()
            .map(|id| self.publish(Topic::User(*id), event.clone()))
            .sum()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.lock().topics.get(&topic).map_or(0, Vec::len)
    }

    pub fn topic_count(&self) -> usize {
        self.lock().topics.len()
    }
}

/// A live feed on one topic. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    topic: Topic,
    rx: mpsc::Receiver<LiveEvent>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next event; `None` once the broker is gone.
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LiveEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.remove(self.topic, self.id);
            tracing::debug!(topic = %self.topic, subscriber = self.id, "unsubscribed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread_created(id: i64) -> LiveEvent {
        LiveEvent::ThreadCreated {
            thread_id: id,
            title: format!("thread {}", id),
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_of_topic() {
        let broker = Broker::new(8);
        let mut a = broker.subscribe(Topic::User(1));
        let mut b = broker.subscribe(Topic::User(1));

        assert_eq!(broker.publish(Topic::User(1), thread_created(5)), 2);
        assert_eq!(a.recv().await, Some(thread_created(5)));
        assert_eq!(b.recv().await, Some(thread_created(5)));
    }

    #[tokio::test]
    async fn publish_does_not_cross_topics() {
        let broker = Broker::new(8);
        let mut user = broker.subscribe(Topic::User(1));
        let mut thread = broker.subscribe(Topic::Thread(1));

        assert_eq!(broker.publish(Topic::Thread(1), thread_created(1)), 1);
        assert!(user.try_recv().is_none());
        assert_eq!(thread.recv().await, Some(thread_created(1)));
    }

    #[test]
    fn publish_without_subscribers_returns_zero() {
        let broker = Broker::new(8);
        assert_eq!(broker.publish(Topic::User(9), thread_created(1)), 0);
        assert_eq!(broker.topic_count(), 0);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let broker = Broker::new(8);
        let a = broker.subscribe(Topic::Thread(3));
        let b = broker.subscribe(Topic::Thread(3));
        assert_eq!(broker.subscriber_count(Topic::Thread(3)), 2);

        drop(a);
        assert_eq!(broker.subscriber_count(Topic::Thread(3)), 1);
        drop(b);
        assert_eq!(broker.subscriber_count(Topic::Thread(3)), 0);
        assert_eq!(broker.topic_count(), 0);
    }

    #[test]
    fn full_subscriber_misses_events_without_blocking() {
        let broker = Broker::new(1);
        let mut slow = broker.subscribe(Topic::User(1));

        assert_eq!(broker.publish(Topic::User(1), thread_created(1)), 1);
        assert_eq!(broker.publish(Topic::User(1), thread_created(2)), 0);
        // Still subscribed, just missed the second event.
        assert_eq!(broker.subscriber_count(Topic::User(1)), 1);

        assert_eq!(slow.try_recv(), Some(thread_created(1)));
        assert!(slow.try_recv().is_none());
        assert_eq!(broker.publish(Topic::User(1), thread_created(3)), 1);
        assert_eq!(slow.try_recv(), Some(thread_created(3)));
    }

    #[test]
    fn publish_count_matches_accepted_deliveries() {
        let broker = Broker::new(1);
        let _full = broker.subscribe(Topic::User(1));
        broker.publish(Topic::User(1), thread_created(0));
        let _fresh = broker.subscribe(Topic::User(1));

        assert_eq!(broker.publish(Topic::User(1), thread_created(1)), 1);
    }

    #[test]
    fn events_arrive_in_publish_order() {
        let broker = Broker::new(8);
        let mut sub = broker.subscribe(Topic::Thread(1));
        for i in 0..5 {
            broker.publish(Topic::Thread(1), thread_created(i));
        }
        for i in 0..5 {
            assert_eq!(sub.try_recv(), Some(thread_created(i)));
        }
    }

    #[test]
    fn publish_to_users_fans_out() {
        let broker = Broker::new(4);
        let mut one = broker.subscribe(Topic::User(1));
        let mut two = broker.subscribe(Topic::User(2));
        let event = thread_created(7);

        assert_eq!(broker.publish_to_users(&[1, 2, 3], &event), 2);
        assert_eq!(one.try_recv(), Some(event.clone()));
        assert_eq!(two.try_recv(), Some(event));
    }

    #[test]
    fn subscription_outliving_broker_is_harmless() {
        let broker = Broker::new(4);
        let sub = broker.subscribe(Topic::User(1));
        assert_eq!(sub.topic(), Topic::User(1));
        drop(broker);
        drop(sub);
    }

    #[test]
    fn live_event_serializes_with_type_and_data() {
        let event = LiveEvent::RequestDecided {
            request_id: 4,
            status: RequestStatus::Approved,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "RequestDecided");
        assert_eq!(json["data"]["request_id"], 4);
        assert_eq!(json["data"]["status"], "approved");
        assert_eq!(event.kind(), "request_decided");
    }
}

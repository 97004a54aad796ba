//! Topic-addressed pub/sub fabric.
//!
//! Topics are hierarchical strings (`urn:osh:registry`,
//! `urn:osh:system:<uid>`, `urn:osh:system:<uid>/<stream>`). Delivery
//! within a topic follows publication order. Demand is explicit and
//! bounded: a subscription with zero demand drops events and counts them
//! instead of blocking the publisher, so slow subscribers never stall
//! fast ones.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use crate::models::feature::FeatureRecord;
use crate::models::swe::DataComponent;

/// Global system lifecycle topic.
pub const REGISTRY_TOPIC: &str = "urn:osh:registry";

pub fn system_topic(system_uid: &str) -> String {
    format!("urn:osh:system:{system_uid}")
}

pub fn stream_topic(system_uid: &str, output_name: &str) -> String {
    format!("urn:osh:system:{system_uid}/{output_name}")
}

/// A batch of records produced by one system output.
#[derive(Debug, Clone, PartialEq)]
pub struct DataEvent {
    pub system_uid: String,
    pub output_name: String,
    /// UID of the observed feature; `None` inherits the system's current
    /// FOI (or no FOI at all).
    pub foi_uid: Option<String>,
    /// Producer-side timestamp, the fallback phenomenon time.
    pub timestamp_ms: i64,
    pub record_schema: DataComponent,
    pub records: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SystemAdded { uid: String },
    SystemUpdated { uid: String, record: FeatureRecord },
    SystemRemoved { uid: String },
    FoiChanged { system_uid: String, foi: FeatureRecord },
    Data(Arc<DataEvent>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    System,
    Foi,
    Data,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SystemAdded { .. } | Event::SystemUpdated { .. } | Event::SystemRemoved { .. } => {
                EventKind::System
            }
            Event::FoiChanged { .. } => EventKind::Foi,
            Event::Data(_) => EventKind::Data,
        }
    }
}

struct SubEntry {
    id: u64,
    kinds: HashSet<EventKind>,
    demand: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<String, Vec<SubEntry>>>,
    next_sub_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a subscription for `kinds` on one topic with an initial
    /// demand. Delivery stops (and drops are counted) once demand reaches
    /// zero; `Subscription::request` opens it again.
    pub fn subscribe(
        self: &Arc<Self>,
        topic: impl Into<String>,
        kinds: impl IntoIterator<Item = EventKind>,
        initial_demand: u64,
    ) -> Subscription {
        let topic = topic.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let entry = SubEntry {
            id,
            kinds: kinds.into_iter().collect(),
            demand: Arc::new(AtomicU64::new(initial_demand)),
            dropped: Arc::new(AtomicU64::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
            tx,
        };
        let sub = Subscription {
            bus: Arc::downgrade(self),
            topic: topic.clone(),
            id,
            rx,
            demand: entry.demand.clone(),
            dropped: entry.dropped.clone(),
            cancelled: entry.cancelled.clone(),
        };
        self.topics.lock().unwrap().entry(topic).or_default().push(entry);
        sub
    }

    /// Fans `event` out to every matching subscription on `topic`.
    /// The publisher never blocks: subscribers without demand lose the
    /// event and their dropped counter is incremented.
    pub fn publish(&self, topic: &str, event: Event) {
        let kind = event.kind();
        let mut topics = self.topics.lock().unwrap();
        let Some(subs) = topics.get_mut(topic) else {
            return;
        };
        subs.retain(|sub| {
            if sub.cancelled.load(Ordering::Acquire) {
                return false;
            }
            if !sub.kinds.contains(&kind) {
                return true;
            }
            // Claim one unit of demand, or count the event as dropped.
            let mut current = sub.demand.load(Ordering::Acquire);
            loop {
                if current == 0 {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                match sub.demand.compare_exchange_weak(
                    current,
                    current - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(seen) => current = seen,
                }
            }
            // A closed receiver means the subscription was dropped.
            sub.tx.send(event.clone()).is_ok()
        });
        if subs.is_empty() {
            topics.remove(topic);
        }
    }

    fn unsubscribe(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.lock().unwrap().get(topic).map_or(0, |s| s.len())
    }
}

/// Caller side of one subscription. Already-delivered events remain
/// receivable after cancellation; new ones stop immediately.
pub struct Subscription {
    bus: Weak<EventBus>,
    topic: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Event>,
    demand: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
}

impl Subscription {
    /// Adds `n` items of demand.
    pub fn request(&self, n: u64) {
        self.demand.fetch_add(n, Ordering::AcqRel);
    }

    /// Detached handle that can cancel this subscription from another task.
    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            bus: self.bus.clone(),
            topic: self.topic.clone(),
            id: self.id,
            cancelled: self.cancelled.clone(),
        }
    }

    /// Events dropped for this subscription because demand was zero.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Unregisters the subscription. In-flight deliveries complete; no
    /// further events are delivered.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.rx.close();
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(&self.topic, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Cancels a subscription owned by another task. Removing the registry
/// entry drops the sender, so the receiving task drains in-flight events
/// and then observes end-of-stream.
pub struct SubscriptionHandle {
    bus: Weak<EventBus>,
    topic: String,
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(&self.topic, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(uid: &str) -> Event {
        Event::SystemAdded { uid: uid.to_string() }
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(system_topic("urn:x:sys:a"), "urn:osh:system:urn:x:sys:a");
        assert_eq!(
            stream_topic("urn:x:sys:a", "temp"),
            "urn:osh:system:urn:x:sys:a/temp"
        );
    }

    #[tokio::test]
    async fn test_delivery_in_publication_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("t", [EventKind::System], 100);
        for i in 0..5 {
            bus.publish("t", event(&format!("u{i}")));
        }
        for i in 0..5 {
            match sub.recv().await.unwrap() {
                Event::SystemAdded { uid } => assert_eq!(uid, format!("u{i}")),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_zero_demand_drops_without_blocking() {
        let bus = EventBus::new();
        let mut eager = bus.subscribe("t", [EventKind::System], 10);
        let mut starved = bus.subscribe("t", [EventKind::System], 0);
        for i in 0..5 {
            bus.publish("t", event(&format!("u{i}")));
        }
        for _ in 0..5 {
            assert!(eager.recv().await.is_some());
        }
        assert_eq!(starved.dropped(), 5);
        assert!(starved.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_demand_replenishment() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("t", [EventKind::System], 1);
        bus.publish("t", event("a"));
        bus.publish("t", event("b"));
        assert_eq!(sub.dropped(), 1);
        assert!(sub.recv().await.is_some());

        sub.request(1);
        bus.publish("t", event("c"));
        assert!(matches!(sub.recv().await, Some(Event::SystemAdded { uid }) if uid == "c"));
    }

    #[tokio::test]
    async fn test_kind_filtering() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("t", [EventKind::Foi], 10);
        bus.publish("t", event("ignored"));
        bus.publish(
            "t",
            Event::FoiChanged {
                system_uid: "s".into(),
                foi: FeatureRecord {
                    uid: "urn:x:foi:0001".into(),
                    name: "foi".into(),
                    description: None,
                    feature_type: None,
                    geometry: None,
                    properties: Default::default(),
                    parent_id: 0,
                },
            },
        );
        assert!(matches!(sub.recv().await, Some(Event::FoiChanged { .. })));
        // The system event was neither delivered nor counted as dropped.
        assert_eq!(sub.dropped(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unregisters() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("t", [EventKind::System], 10);
        assert_eq!(bus.subscriber_count("t"), 1);
        sub.cancel();
        assert_eq!(bus.subscriber_count("t"), 0);
        bus.publish("t", event("late"));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("a", [EventKind::System], 10);
        let _b = bus.subscribe("b", [EventKind::System], 10);
        bus.publish("b", event("only-b"));
        assert!(a.try_recv().is_none());
    }
}

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

use super::queue::{OutboundQueue, PushOutcome, SubscriptionFilter};
use crate::record::{DiffEntry, Encoding};

/// Parameters a connection settled on at subscribe time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub id: u64,
    pub encoding: Encoding,
    pub cadence: Duration,
    pub filter: SubscriptionFilter,
}

#[derive(Debug)]
pub struct Subscriber {
    pub info: SubscriberInfo,
    pub queue: OutboundQueue,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub subscribers: usize,
    pub queued: usize,
    pub filtered: usize,
    pub overflowed: usize,
    pub pruned: usize,
}

/// Registry of live subscriptions.
#[derive(Debug)]
pub struct Hub {
    queue_capacity: usize,
    entry_limit: Option<usize>,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Arc<Subscriber>>>,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            entry_limit: None,
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Entry budget for every queue created from now on.
    pub fn with_entry_limit(mut self, entry_limit: Option<usize>) -> Self {
        self.entry_limit = entry_limit;
        self
    }

    pub fn subscribe(
        &self,
        encoding: Encoding,
        cadence: Duration,
        filter: SubscriptionFilter,
    ) -> Arc<Subscriber> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            info: SubscriberInfo {
                id,
                encoding,
                cadence,
                filter,
            },
            queue: match self.entry_limit {
                Some(limit) => OutboundQueue::new(self.queue_capacity, filter).with_entry_limit(limit),
                None => OutboundQueue::new(self.queue_capacity, filter),
            },
        });
        self.subscribers.lock().insert(id, Arc::clone(&subscriber));
        tracing::info!(
            subscription_id = id,
            %encoding,
            cadence_ms = cadence.as_millis() as u64,
            min_risk = filter.min_risk,
            min_shock = filter.min_shock,
            "subscriber added"
        );
        subscriber
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Some(subscriber) = self.subscribers.lock().remove(&id) {
            subscriber.queue.close();
            tracing::info!(subscription_id = id, "subscriber removed");
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes one drained diff into every subscriber queue. The registry lock
    /// is released before any queue is touched.
    pub fn deliver(&self, entries: &[DiffEntry]) -> DeliveryReport {
        let subscribers: Vec<Arc<Subscriber>> = self.subscribers.lock().values().cloned().collect();
        let mut report = DeliveryReport {
            subscribers: subscribers.len(),
            ..DeliveryReport::default()
        };
        let mut closed = Vec::new();

        for subscriber in &subscribers {
            match subscriber.queue.push(entries) {
                PushOutcome::Queued => report.queued += 1,
                PushOutcome::Filtered => report.filtered += 1,
                PushOutcome::SnapshotPending => {}
                PushOutcome::Overflowed => {
                    report.overflowed += 1;
                    tracing::warn!(
                        subscription_id = subscriber.info.id,
                        capacity = subscriber.queue.capacity(),
                        "outbound queue overflowed, resnapshot scheduled"
                    );
                }
                PushOutcome::Closed => closed.push(subscriber.info.id),
            }
        }

        if !closed.is_empty() {
            let mut registry = self.subscribers.lock();
            for id in &closed {
                registry.remove(id);
            }
            report.pruned = closed.len();
        }
        report
    }

    /// Closes every queue, ending all writer tasks.
    pub fn close_all(&self) {
        let drained: Vec<Arc<Subscriber>> =
            self.subscribers.lock().drain().map(|(_, s)| s).collect();
        for subscriber in drained {
            subscriber.queue.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bitmask::MetaLayout,
        broadcast::queue::Delivery,
        buffer::PointBuffer,
        record::EntityRecord,
        types::{EntityIndex, WorldPoint},
    };

    fn entries() -> Vec<DiffEntry> {
        vec![DiffEntry {
            index: EntityIndex(0),
            attr: 0,
            meta: 0x0000_FF00,
        }]
    }

    #[test]
    fn test_slow_subscriber_does_not_affect_others() {
        let buffer = PointBuffer::new(
            vec![EntityRecord::new(WorldPoint::planar(0.0, 0.0), 0, 0)],
            MetaLayout::Standard,
        );
        let hub = Hub::new(1).with_entry_limit(Some(1));
        let fast = hub.subscribe(Encoding::Compact, Duration::from_millis(100), SubscriptionFilter::default());
        let slow = hub.subscribe(Encoding::Compact, Duration::from_millis(100), SubscriptionFilter::default());
        for subscriber in [&fast, &slow] {
            subscriber.queue.take(|| buffer.snapshot(Encoding::Compact));
        }

        for i in 0..3 {
            hub.deliver(&[DiffEntry {
                index: EntityIndex(i),
                attr: 0,
                meta: 0x0000_FF00,
            }]);
            assert!(matches!(
                fast.queue.take(|| buffer.snapshot(Encoding::Compact)),
                Some(Delivery::Diff(_))
            ));
        }
        assert!(slow.queue.needs_snapshot());
        assert!(!fast.queue.needs_snapshot());
    }

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let hub = Hub::new(4);
        let a = hub.subscribe(Encoding::Compact, Duration::from_millis(50), SubscriptionFilter::default());
        let _b = hub.subscribe(Encoding::Extended, Duration::from_millis(50), SubscriptionFilter::default());
        assert_ne!(a.info.id, _b.info.id);
        a.queue.close();

        let report = hub.deliver(&entries());
        assert_eq!(report.subscribers, 2);
        assert_eq!(report.pruned, 1);
        assert_eq!(hub.len(), 1);

        hub.close_all();
        assert!(hub.is_empty());
    }
}

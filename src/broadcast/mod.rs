//! Diff broadcasting: the periodic broadcaster, the subscriber registry and
//! the bounded per-connection queues between them.

pub mod broadcaster;
pub mod hub;
pub mod queue;

pub use broadcaster::{BroadcastStats, Broadcaster, CycleOutcome};
pub use hub::{DeliveryReport, Hub, Subscriber, SubscriberInfo};
pub use queue::{Delivery, OutboundQueue, PushOutcome, QueueStats, SubscriptionFilter};

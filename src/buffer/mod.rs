// Buffer module - LOCAL DELIVERY

mod queue;

pub use queue::{DeliveryQueue, DEFAULT_QUEUE_CAPACITY};

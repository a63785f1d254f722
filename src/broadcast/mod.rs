pub mod coalescer;
pub mod registry;

pub use coalescer::run_broadcaster;
pub use registry::{SubscriberId, SubscriberRegistry};

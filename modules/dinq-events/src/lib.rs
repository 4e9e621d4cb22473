pub mod broker;
pub mod durable;
pub mod stream;
pub mod types;

pub use broker::RealtimeBroker;
pub use durable::{CardOutputSink, DurableEventStore};
pub use stream::EventStore;
pub use types::{AppendEvent, EventType, StoredEvent, StreamField};

pub mod broker;
pub mod event;
pub mod lifecycle;

pub use broker::{create_message_broker, MessageBroker};
pub use event::{EventMessage, EventSink, EventType};
pub use lifecycle::LifecycleEvents;

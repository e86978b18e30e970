//! Cluster membership events.

pub mod events;

pub use events::{LoggingEventListener, MemberEvent, MemberEventListener, ProcessorEventListener};

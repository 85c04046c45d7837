//! Event streaming to external subscribers

pub mod publisher;
pub mod wire;

pub use publisher::EventPublisher;
pub use wire::{Serializer, WireFormat};

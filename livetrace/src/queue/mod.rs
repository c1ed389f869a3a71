//! Cross-thread message transport
//!
//! Instrumented threads are the producers, the orchestrator thread is the
//! single consumer.

pub mod message_queue;

pub use message_queue::{Message, MessageHeader, MessageQueue};

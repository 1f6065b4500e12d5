//! Integration events and the transactional outbox record.
//!
//! Domain crates describe *what happened* with typed events implementing
//! [`Event`]; infrastructure turns them into [`OutboxEvent`] rows written in the
//! same transaction as the state change. Publishing those rows is the job of an
//! external dispatcher.

pub mod event;
pub mod outbox;

pub use event::Event;
pub use outbox::{OutboxError, OutboxEvent, OutboxStatus};

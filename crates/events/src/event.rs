use chrono::{DateTime, Utc};

/// A domain-agnostic integration event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - addressed to an aggregate, so consumers can order and partition them
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "inventory.stock.received").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Aggregate family the event belongs to (e.g. "inventory.balance").
    fn aggregate_type(&self) -> &'static str;

    /// Opaque aggregate key within [`Event::aggregate_type`].
    fn aggregate_id(&self) -> String;
}

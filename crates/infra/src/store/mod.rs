//! Ledger storage boundary.
//!
//! Two implementations share the decision logic in `stockledger_inventory`:
//! an in-memory store for tests and development, and a Postgres store that
//! takes explicit row locks.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use r#trait::{
    Applied, BalanceFilter, BalanceListing, LedgerQueries, LedgerStore, LocationStatus,
    OwnershipDirectory, PriorMovement,
};

use chrono::{DateTime, Utc};

use stockledger_events::OutboxEvent;
use stockledger_inventory::{InventoryEvent, Movement};

use crate::error::StoreError;

/// The pending outbox row for a decided movement.
pub(crate) fn outbox_row(
    movement: &Movement,
    event: &InventoryEvent,
    now: DateTime<Utc>,
) -> Result<OutboxEvent, StoreError> {
    Ok(OutboxEvent::pending(
        Some(event.organization_id()),
        event,
        movement.meta().trace_id.clone(),
        now,
    )?)
}

//! Inventory ledger domain.
//!
//! Balances, ledger entries, reservations and the movement rules that tie them
//! together, implemented purely as deterministic domain logic (no IO, no
//! storage). Storage backends lock rows, call [`movement::decide`] and persist
//! what it returns.

pub mod balance;
pub mod error;
pub mod event;
pub mod ledger;
pub mod location;
pub mod movement;
pub mod reservation;
pub mod variant;

pub use balance::{Balance, BalanceKey};
pub use error::{InventoryError, ReferenceKind};
pub use event::{
    InventoryEvent, ReservationReleased, StockAdjusted, StockReceived, StockReserved, StockShipped,
    StockTransferred,
};
pub use ledger::{LedgerEntry, MovementType, SourceRef};
pub use location::{Location, LocationRegistry};
pub use movement::{
    Adjust, Decision, LockedState, Movement, MovementMeta, MovementWrites, Receive, Release,
    Reserve, ReservationWrite, Ship, Transfer, decide, lock_order, normalize_deduplication_key,
};
pub use reservation::{Reservation, ReservationStatus};
pub use variant::VariantRef;

//! Infrastructure layer: storage, configuration and the ledger engine.

pub mod config;
pub mod engine;
pub mod error;
pub mod store;


pub use config::{ConfigError, DedupKeyPolicy, LedgerConfig};
pub use engine::{LedgerEngine, MovementOutcome, OutcomeKind};
pub use error::{LedgerError, StoreError};
pub use store::{
    Applied, BalanceFilter, BalanceListing, InMemoryLedgerStore, LedgerQueries, LedgerStore,
    LocationStatus, OwnershipDirectory, PostgresLedgerStore, PriorMovement,
};

use thiserror::Error;

use stockledger_inventory::InventoryError;

/// Storage failure.
///
/// These are infrastructure errors (connectivity, constraints, encoding) as
/// opposed to the business failures in [`InventoryError`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness constraint fired (usually a concurrent twin of the same movement).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),

    /// A stored row could not be decoded, or a value could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Pool closed, timed out or otherwise not reachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<stockledger_events::OutboxError> for StoreError {
    fn from(err: stockledger_events::OutboxError) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Error returned by every ledger operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// The business failure, if this is one.
    pub fn inventory(&self) -> Option<&InventoryError> {
        match self {
            LedgerError::Inventory(e) => Some(e),
            LedgerError::Store(_) => None,
        }
    }
}

impl From<stockledger_core::DomainError> for LedgerError {
    fn from(err: stockledger_core::DomainError) -> Self {
        LedgerError::Inventory(err.into())
    }
}

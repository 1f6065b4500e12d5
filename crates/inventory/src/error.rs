//! Named inventory failures.
//!
//! Every variant is something a caller can branch on: retry, compensate, or
//! show a message. Storage failures are not represented here.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockledger_core::{DomainError, LocationId, OrganizationId, ReservationId};

use crate::reservation::ReservationStatus;

/// Kind of entity a movement references.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Variant,
    Location,
    Reservation,
}

impl core::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ReferenceKind::Variant => "variant",
            ReferenceKind::Location => "location",
            ReferenceKind::Reservation => "reservation",
        };
        f.write_str(s)
    }
}

impl ReferenceKind {
    /// Tenant isolation check for a looked-up reference.
    ///
    /// `owner` is the owning organization reported by the directory, or `None`
    /// if the reference does not exist.
    pub fn ensure_owned(
        self,
        id: impl core::fmt::Display,
        owner: Option<OrganizationId>,
        organization_id: OrganizationId,
    ) -> Result<(), InventoryError> {
        match owner {
            None => Err(InventoryError::NotFound {
                kind: self,
                id: id.to_string(),
            }),
            Some(o) if o != organization_id => Err(InventoryError::CrossTenantReference {
                kind: self,
                id: id.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InventoryError {
    #[error("invalid quantity: {quantity}")]
    InvalidQuantity { quantity: Decimal },

    #[error("transfer origin and destination must differ")]
    SameLocationTransfer,

    #[error("a deduplication key is required")]
    MissingDeduplicationKey,

    #[error("{kind} {id} not found")]
    NotFound { kind: ReferenceKind, id: String },

    #[error("{kind} {id} belongs to another organization")]
    CrossTenantReference { kind: ReferenceKind, id: String },

    #[error("location {location_id} is inactive")]
    InactiveLocation { location_id: LocationId },

    #[error("insufficient stock: available {available}, requested {requested}")]
    InsufficientStock {
        available: Decimal,
        requested: Decimal,
    },

    #[error("on-hand {requested} would fall below reserved {reserved}")]
    BelowReserved {
        requested: Decimal,
        reserved: Decimal,
    },

    #[error("reservation {reservation_id} is {status}, expected active")]
    InvalidReservationState {
        reservation_id: ReservationId,
        status: ReservationStatus,
    },

    #[error("reservation holds {held}, cannot ship {requested}")]
    ReservationQuantityExceeded { held: Decimal, requested: Decimal },

    #[error("reservation {reservation_id} does not cover this location and variant")]
    ReservationMismatch { reservation_id: ReservationId },

    #[error("reservation expiry {expires_at} is not in the future")]
    ExpiryInPast { expires_at: DateTime<Utc> },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl InventoryError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Input was rejected as malformed; nothing was written.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            InventoryError::InvalidQuantity { .. }
                | InventoryError::SameLocationTransfer
                | InventoryError::MissingDeduplicationKey
                | InventoryError::ExpiryInPast { .. }
                | InventoryError::Domain(_)
        )
    }
}

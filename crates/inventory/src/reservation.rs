//! Reservations and their lifecycle.
//!
//! ```text
//! Pending ──confirm──▶ Active ──release──▶ Cancelled
//!                        │
//!                        └────ship───────▶ Consumed
//! ```
//!
//! `Cancelled` and `Consumed` are terminal. Nothing creates `Pending`
//! reservations yet; reserve goes straight to `Active`. Expiry is informational:
//! an expired `Active` reservation still holds stock until it is released.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use stockledger_core::{LedgerEntryId, LocationId, OrganizationId, ReservationId, VariantId};

use crate::balance::BalanceKey;
use crate::error::InventoryError;
use crate::ledger::SourceRef;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Active,
    Cancelled,
    Consumed,
}

impl ReservationStatus {
    pub fn as_code(self) -> i16 {
        match self {
            ReservationStatus::Pending => 0,
            ReservationStatus::Active => 1,
            ReservationStatus::Cancelled => 2,
            ReservationStatus::Consumed => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(ReservationStatus::Pending),
            1 => Some(ReservationStatus::Active),
            2 => Some(ReservationStatus::Cancelled),
            3 => Some(ReservationStatus::Consumed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationStatus::Cancelled | ReservationStatus::Consumed)
    }

    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        matches!(
            (self, next),
            (ReservationStatus::Pending, ReservationStatus::Active)
                | (ReservationStatus::Active, ReservationStatus::Cancelled)
                | (ReservationStatus::Active, ReservationStatus::Consumed)
        )
    }
}

impl core::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Active => "active",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Consumed => "consumed",
        };
        f.write_str(s)
    }
}

/// A hold against available stock at one balance key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub organization_id: OrganizationId,
    pub location_id: LocationId,
    pub variant_id: VariantId,
    pub quantity: Decimal,
    pub status: ReservationStatus,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub source: SourceRef,
    pub deduplication_key: String,
    pub metadata: Map<String, JsonValue>,
    pub created_entry_id: Option<LedgerEntryId>,
    pub closed_entry_id: Option<LedgerEntryId>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.organization_id, self.location_id, self.variant_id)
    }

    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    /// Past its expiry while still holding stock.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn ensure_active(&self) -> Result<(), InventoryError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(InventoryError::InvalidReservationState {
                reservation_id: self.id,
                status: self.status,
            })
        }
    }

    /// Active → Cancelled.
    pub fn cancel(&mut self, entry_id: LedgerEntryId, at: DateTime<Utc>) -> Result<(), InventoryError> {
        self.close(ReservationStatus::Cancelled, entry_id, at)
    }

    /// Active → Consumed.
    pub fn consume(&mut self, entry_id: LedgerEntryId, at: DateTime<Utc>) -> Result<(), InventoryError> {
        self.close(ReservationStatus::Consumed, entry_id, at)
    }

    fn close(
        &mut self,
        next: ReservationStatus,
        entry_id: LedgerEntryId,
        at: DateTime<Utc>,
    ) -> Result<(), InventoryError> {
        if !self.status.can_transition_to(next) {
            return Err(InventoryError::InvalidReservationState {
                reservation_id: self.id,
                status: self.status,
            });
        }
        self.status = next;
        self.closed_entry_id = Some(entry_id);
        self.closed_at = Some(at);
        Ok(())
    }
}

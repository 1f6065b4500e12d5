use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{LocationId, OrganizationId, VariantId};

use crate::error::InventoryError;

/// Identity of a balance row.
///
/// The derived ordering (organization, location, variant) is the lock order:
/// any transaction touching several balances locks them sorted by key, so two
/// transfers running in opposite directions cannot deadlock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BalanceKey {
    pub organization_id: OrganizationId,
    pub location_id: LocationId,
    pub variant_id: VariantId,
}

impl BalanceKey {
    pub fn new(
        organization_id: OrganizationId,
        location_id: LocationId,
        variant_id: VariantId,
    ) -> Self {
        Self {
            organization_id,
            location_id,
            variant_id,
        }
    }
}

impl core::fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.location_id, self.variant_id)
    }
}

/// Stock position of one variant at one location.
///
/// Created lazily (all zeros) on the first movement that references the key and
/// never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub organization_id: OrganizationId,
    pub location_id: LocationId,
    pub variant_id: VariantId,
    pub on_hand: Decimal,
    pub reserved: Decimal,
    pub last_movement_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn empty(key: BalanceKey, now: DateTime<Utc>) -> Self {
        Self {
            organization_id: key.organization_id,
            location_id: key.location_id,
            variant_id: key.variant_id,
            on_hand: Decimal::ZERO,
            reserved: Decimal::ZERO,
            last_movement_at: None,
            updated_at: now,
        }
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.organization_id, self.location_id, self.variant_id)
    }

    /// Quantity that can be newly reserved or shipped without a reservation.
    pub fn available(&self) -> Decimal {
        self.on_hand - self.reserved
    }

    /// `on_hand >= 0 && reserved >= 0 && on_hand >= reserved`.
    pub fn check_invariant(&self) -> Result<(), InventoryError> {
        if self.on_hand < Decimal::ZERO {
            return Err(InventoryError::invariant(format!(
                "on_hand is negative ({}) at {}",
                self.on_hand,
                self.key()
            )));
        }
        if self.reserved < Decimal::ZERO {
            return Err(InventoryError::invariant(format!(
                "reserved is negative ({}) at {}",
                self.reserved,
                self.key()
            )));
        }
        if self.on_hand < self.reserved {
            return Err(InventoryError::invariant(format!(
                "on_hand {} is below reserved {} at {}",
                self.on_hand,
                self.reserved,
                self.key()
            )));
        }
        Ok(())
    }

    /// Apply signed deltas and re-check the invariant.
    ///
    /// On error `self` is left untouched.
    pub fn apply_delta(
        &mut self,
        delta_on_hand: Decimal,
        delta_reserved: Decimal,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), InventoryError> {
        let mut next = self.clone();
        next.on_hand += delta_on_hand;
        next.reserved += delta_reserved;
        next.check_invariant()?;

        next.last_movement_at = Some(match next.last_movement_at {
            Some(prev) if prev > occurred_at => prev,
            _ => occurred_at,
        });
        next.updated_at = now;
        *self = next;
        Ok(())
    }
}

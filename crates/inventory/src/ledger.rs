//! Immutable ledger log records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use stockledger_core::{LedgerEntryId, LocationId, OrganizationId, ReservationId, VariantId};

use crate::balance::BalanceKey;
use crate::error::InventoryError;
use crate::movement::MovementMeta;

/// What kind of movement produced a ledger entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    Receive,
    Adjust,
    TransferOut,
    TransferIn,
    Reserve,
    Release,
    Ship,
}

impl MovementType {
    /// Column encoding. Only the persistence layer should see these numbers.
    pub fn as_code(self) -> i16 {
        match self {
            MovementType::Receive => 1,
            MovementType::Adjust => 2,
            MovementType::TransferOut => 3,
            MovementType::TransferIn => 4,
            MovementType::Reserve => 5,
            MovementType::Release => 6,
            MovementType::Ship => 7,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(MovementType::Receive),
            2 => Some(MovementType::Adjust),
            3 => Some(MovementType::TransferOut),
            4 => Some(MovementType::TransferIn),
            5 => Some(MovementType::Reserve),
            6 => Some(MovementType::Release),
            7 => Some(MovementType::Ship),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MovementType::Receive => "receive",
            MovementType::Adjust => "adjust",
            MovementType::TransferOut => "transfer_out",
            MovementType::TransferIn => "transfer_in",
            MovementType::Reserve => "reserve",
            MovementType::Release => "release",
            MovementType::Ship => "ship",
        }
    }
}

/// Free-form provenance of a movement (e.g. `purchase_order` / `PO-17` / `3`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_type: Option<String>,
    pub source_id: Option<String>,
    pub source_line: Option<String>,
}

impl SourceRef {
    pub fn new(source_type: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            source_type: Some(source_type.into()),
            source_id: Some(source_id.into()),
            source_line: None,
        }
    }

    pub fn with_line(mut self, line: impl Into<String>) -> Self {
        self.source_line = Some(line.into());
        self
    }
}

/// One signed quantity change at one balance key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub organization_id: OrganizationId,
    pub location_id: LocationId,
    pub variant_id: VariantId,
    pub delta_on_hand: Decimal,
    pub delta_reserved: Decimal,
    pub movement_type: MovementType,
    pub reason: Option<String>,
    pub source: SourceRef,
    pub deduplication_key: String,
    /// Reservation created or closed by this entry.
    pub reservation_id: Option<ReservationId>,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub metadata: Map<String, JsonValue>,
}

impl LedgerEntry {
    /// Record a movement against `key`.
    ///
    /// Rejects entries that change nothing.
    pub fn record(
        key: BalanceKey,
        movement_type: MovementType,
        delta_on_hand: Decimal,
        delta_reserved: Decimal,
        meta: &MovementMeta,
        reservation_id: Option<ReservationId>,
        now: DateTime<Utc>,
    ) -> Result<Self, InventoryError> {
        if delta_on_hand.is_zero() && delta_reserved.is_zero() {
            return Err(InventoryError::invariant(format!(
                "{} entry at {key} has no effect",
                movement_type.as_str()
            )));
        }

        Ok(Self {
            id: LedgerEntryId::new(),
            organization_id: key.organization_id,
            location_id: key.location_id,
            variant_id: key.variant_id,
            delta_on_hand,
            delta_reserved,
            movement_type,
            reason: meta.reason.clone(),
            source: meta.source.clone(),
            deduplication_key: meta.deduplication_key.clone(),
            reservation_id,
            occurred_at: meta.occurred_at.unwrap_or(now),
            created_at: now,
            metadata: meta.metadata.clone(),
        })
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.organization_id, self.location_id, self.variant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn movement_codes_round_trip_and_reject_unknown() {
        let all = [
            MovementType::Receive,
            MovementType::Adjust,
            MovementType::TransferOut,
            MovementType::TransferIn,
            MovementType::Reserve,
            MovementType::Release,
            MovementType::Ship,
        ];
        for t in all {
            assert_eq!(MovementType::from_code(t.as_code()), Some(t));
        }
        assert_eq!(MovementType::from_code(0), None);
        assert_eq!(MovementType::from_code(8), None);
    }

    #[test]
    fn no_op_entry_is_rejected() {
        let key = BalanceKey::new(OrganizationId::new(), LocationId::new(), VariantId::new());
        let meta = MovementMeta::keyed("k");
        let err = LedgerEntry::record(
            key,
            MovementType::Adjust,
            Decimal::ZERO,
            Decimal::ZERO,
            &meta,
            None,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, InventoryError::InvariantViolation(_)));
    }

    #[test]
    fn entry_copies_provenance_from_meta() {
        let key = BalanceKey::new(OrganizationId::new(), LocationId::new(), VariantId::new());
        let occurred = Utc::now() - chrono::Duration::minutes(5);
        let meta = MovementMeta::keyed("po-17:3")
            .with_reason("supplier delivery")
            .with_source(SourceRef::new("purchase_order", "PO-17").with_line("3"))
            .with_occurred_at(occurred);

        let entry =
            LedgerEntry::record(key, MovementType::Receive, dec!(4), Decimal::ZERO, &meta, None, Utc::now())
                .unwrap();

        assert_eq!(entry.key(), key);
        assert_eq!(entry.deduplication_key, "po-17:3");
        assert_eq!(entry.reason.as_deref(), Some("supplier delivery"));
        assert_eq!(entry.source.source_line.as_deref(), Some("3"));
        assert_eq!(entry.occurred_at, occurred);
    }
}

//! Integration events written to the outbox, one per applied movement.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{LedgerEntryId, LocationId, OrganizationId, ReservationId, VariantId};
use stockledger_events::Event;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReceived {
    pub organization_id: OrganizationId,
    pub location_id: LocationId,
    pub variant_id: VariantId,
    pub quantity: Decimal,
    pub on_hand: Decimal,
    pub entry_id: LedgerEntryId,
    pub deduplication_key: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjusted {
    pub organization_id: OrganizationId,
    pub location_id: LocationId,
    pub variant_id: VariantId,
    pub previous_on_hand: Decimal,
    pub on_hand: Decimal,
    pub delta: Decimal,
    pub entry_id: LedgerEntryId,
    pub deduplication_key: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockTransferred {
    pub organization_id: OrganizationId,
    pub variant_id: VariantId,
    pub from_location_id: LocationId,
    pub to_location_id: LocationId,
    pub quantity: Decimal,
    pub out_entry_id: LedgerEntryId,
    pub in_entry_id: LedgerEntryId,
    pub deduplication_key: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReserved {
    pub organization_id: OrganizationId,
    pub location_id: LocationId,
    pub variant_id: VariantId,
    pub reservation_id: ReservationId,
    pub quantity: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    pub entry_id: LedgerEntryId,
    pub deduplication_key: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationReleased {
    pub organization_id: OrganizationId,
    pub location_id: LocationId,
    pub variant_id: VariantId,
    pub reservation_id: ReservationId,
    pub quantity: Decimal,
    pub entry_id: LedgerEntryId,
    pub deduplication_key: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockShipped {
    pub organization_id: OrganizationId,
    pub location_id: LocationId,
    pub variant_id: VariantId,
    pub quantity: Decimal,
    /// Reservation consumed by the shipment, with the hold it released.
    pub reservation_id: Option<ReservationId>,
    pub released_reserved: Decimal,
    pub entry_id: LedgerEntryId,
    pub deduplication_key: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum InventoryEvent {
    StockReceived(StockReceived),
    StockAdjusted(StockAdjusted),
    StockTransferred(StockTransferred),
    StockReserved(StockReserved),
    ReservationReleased(ReservationReleased),
    StockShipped(StockShipped),
}

fn balance_aggregate_id(location_id: LocationId, variant_id: VariantId) -> String {
    format!("{location_id}:{variant_id}")
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::StockReceived(_) => "inventory.stock.received",
            InventoryEvent::StockAdjusted(_) => "inventory.stock.adjusted",
            InventoryEvent::StockTransferred(_) => "inventory.stock.transferred",
            InventoryEvent::StockReserved(_) => "inventory.stock.reserved",
            InventoryEvent::ReservationReleased(_) => "inventory.reservation.released",
            InventoryEvent::StockShipped(_) => "inventory.stock.shipped",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryEvent::StockReceived(e) => e.occurred_at,
            InventoryEvent::StockAdjusted(e) => e.occurred_at,
            InventoryEvent::StockTransferred(e) => e.occurred_at,
            InventoryEvent::StockReserved(e) => e.occurred_at,
            InventoryEvent::ReservationReleased(e) => e.occurred_at,
            InventoryEvent::StockShipped(e) => e.occurred_at,
        }
    }

    fn aggregate_type(&self) -> &'static str {
        match self {
            InventoryEvent::StockReceived(_)
            | InventoryEvent::StockAdjusted(_)
            | InventoryEvent::StockShipped(_) => "inventory.balance",
            InventoryEvent::StockTransferred(_) => "inventory.transfer",
            InventoryEvent::StockReserved(_) | InventoryEvent::ReservationReleased(_) => {
                "inventory.reservation"
            }
        }
    }

    fn aggregate_id(&self) -> String {
        match self {
            InventoryEvent::StockReceived(e) => balance_aggregate_id(e.location_id, e.variant_id),
            InventoryEvent::StockAdjusted(e) => balance_aggregate_id(e.location_id, e.variant_id),
            InventoryEvent::StockShipped(e) => balance_aggregate_id(e.location_id, e.variant_id),
            InventoryEvent::StockTransferred(e) => e.variant_id.to_string(),
            InventoryEvent::StockReserved(e) => e.reservation_id.to_string(),
            InventoryEvent::ReservationReleased(e) => e.reservation_id.to_string(),
        }
    }
}

impl InventoryEvent {
    pub fn organization_id(&self) -> OrganizationId {
        match self {
            InventoryEvent::StockReceived(e) => e.organization_id,
            InventoryEvent::StockAdjusted(e) => e.organization_id,
            InventoryEvent::StockTransferred(e) => e.organization_id,
            InventoryEvent::StockReserved(e) => e.organization_id,
            InventoryEvent::ReservationReleased(e) => e.organization_id,
            InventoryEvent::StockShipped(e) => e.organization_id,
        }
    }
}

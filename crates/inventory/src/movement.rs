//! Movement requests and the pure decision function behind every ledger write.
//!
//! `decide` takes the locked balance rows (and reservation, if any) and returns
//! the complete set of writes for one transaction: updated balances, ledger
//! entries, the reservation insert/update, and the integration event. It does
//! no IO, so storage backends share one implementation of the rules.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use stockledger_core::{DomainError, LocationId, OrganizationId, ReservationId, VariantId};

use crate::balance::{Balance, BalanceKey};
use crate::error::InventoryError;
use crate::event::{
    InventoryEvent, ReservationReleased, StockAdjusted, StockReceived, StockReserved, StockShipped,
    StockTransferred,
};
use crate::ledger::{LedgerEntry, MovementType, SourceRef};
use crate::reservation::{Reservation, ReservationStatus};

pub const MAX_DEDUPLICATION_KEY_LEN: usize = 200;

/// Fractional digits the storage columns keep.
pub const MAX_QUANTITY_SCALE: u32 = 4;

/// Caller-supplied context shared by every movement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovementMeta {
    /// Idempotency token, unique per organization. Must be stable across
    /// retries of the same logical operation.
    pub deduplication_key: String,
    pub reason: Option<String>,
    pub source: SourceRef,
    /// Business time; defaults to the time the movement is applied.
    pub occurred_at: Option<DateTime<Utc>>,
    pub metadata: Map<String, JsonValue>,
    pub trace_id: Option<String>,
}

impl MovementMeta {
    pub fn keyed(deduplication_key: impl Into<String>) -> Self {
        Self {
            deduplication_key: deduplication_key.into(),
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_source(mut self, source: SourceRef) -> Self {
        self.source = source;
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Trim a caller-supplied key; blank keys come back as `None`.
pub fn normalize_deduplication_key(raw: &str) -> Result<Option<String>, InventoryError> {
    let key = raw.trim();
    if key.is_empty() {
        return Ok(None);
    }
    if key.chars().count() > MAX_DEDUPLICATION_KEY_LEN {
        return Err(DomainError::validation(format!(
            "deduplication key exceeds {MAX_DEDUPLICATION_KEY_LEN} characters"
        ))
        .into());
    }
    Ok(Some(key.to_string()))
}

fn ensure_positive(quantity: Decimal) -> Result<(), InventoryError> {
    if quantity <= Decimal::ZERO {
        return Err(InventoryError::InvalidQuantity { quantity });
    }
    ensure_scale(quantity)
}

fn ensure_scale(quantity: Decimal) -> Result<(), InventoryError> {
    if quantity.normalize().scale() > MAX_QUANTITY_SCALE {
        return Err(DomainError::validation(format!(
            "quantity {quantity} has more than {MAX_QUANTITY_SCALE} decimal places"
        ))
        .into());
    }
    Ok(())
}

/// Stock arrived at a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receive {
    pub organization_id: OrganizationId,
    pub location_id: LocationId,
    pub variant_id: VariantId,
    pub quantity: Decimal,
    pub meta: MovementMeta,
}

/// Set on-hand to a counted value (stocktake correction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjust {
    pub organization_id: OrganizationId,
    pub location_id: LocationId,
    pub variant_id: VariantId,
    pub new_on_hand: Decimal,
    pub meta: MovementMeta,
}

/// Move available stock between two locations of the same organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub organization_id: OrganizationId,
    pub variant_id: VariantId,
    pub from_location_id: LocationId,
    pub to_location_id: LocationId,
    pub quantity: Decimal,
    pub meta: MovementMeta,
}

/// Hold available stock for a later shipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reserve {
    pub organization_id: OrganizationId,
    pub location_id: LocationId,
    pub variant_id: VariantId,
    pub quantity: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    pub meta: MovementMeta,
}

/// Cancel an active reservation, returning its hold to available stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub organization_id: OrganizationId,
    pub reservation_id: ReservationId,
    pub meta: MovementMeta,
}

/// Stock left the building, optionally against a reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ship {
    pub organization_id: OrganizationId,
    pub location_id: LocationId,
    pub variant_id: VariantId,
    pub quantity: Decimal,
    pub reservation_id: Option<ReservationId>,
    pub meta: MovementMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "movement", rename_all = "snake_case")]
pub enum Movement {
    Receive(Receive),
    Adjust(Adjust),
    Transfer(Transfer),
    Reserve(Reserve),
    Release(Release),
    Ship(Ship),
}

macro_rules! impl_from_movement {
    ($($variant:ident),*) => {
        $(impl From<$variant> for Movement {
            fn from(value: $variant) -> Self {
                Movement::$variant(value)
            }
        })*
    };
}

impl_from_movement!(Receive, Adjust, Transfer, Reserve, Release, Ship);

impl Movement {
    pub fn name(&self) -> &'static str {
        match self {
            Movement::Receive(_) => "receive",
            Movement::Adjust(_) => "adjust",
            Movement::Transfer(_) => "transfer",
            Movement::Reserve(_) => "reserve",
            Movement::Release(_) => "release",
            Movement::Ship(_) => "ship",
        }
    }

    pub fn organization_id(&self) -> OrganizationId {
        match self {
            Movement::Receive(m) => m.organization_id,
            Movement::Adjust(m) => m.organization_id,
            Movement::Transfer(m) => m.organization_id,
            Movement::Reserve(m) => m.organization_id,
            Movement::Release(m) => m.organization_id,
            Movement::Ship(m) => m.organization_id,
        }
    }

    pub fn meta(&self) -> &MovementMeta {
        match self {
            Movement::Receive(m) => &m.meta,
            Movement::Adjust(m) => &m.meta,
            Movement::Transfer(m) => &m.meta,
            Movement::Reserve(m) => &m.meta,
            Movement::Release(m) => &m.meta,
            Movement::Ship(m) => &m.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut MovementMeta {
        match self {
            Movement::Receive(m) => &mut m.meta,
            Movement::Adjust(m) => &mut m.meta,
            Movement::Transfer(m) => &mut m.meta,
            Movement::Reserve(m) => &mut m.meta,
            Movement::Release(m) => &mut m.meta,
            Movement::Ship(m) => &mut m.meta,
        }
    }

    pub fn deduplication_key(&self) -> &str {
        &self.meta().deduplication_key
    }

    /// Existing reservation the movement acts on.
    pub fn reservation_id(&self) -> Option<ReservationId> {
        match self {
            Movement::Release(m) => Some(m.reservation_id),
            Movement::Ship(m) => m.reservation_id,
            _ => None,
        }
    }

    /// Variant named directly by the request (release takes it from the reservation).
    pub fn variant_id(&self) -> Option<VariantId> {
        match self {
            Movement::Receive(m) => Some(m.variant_id),
            Movement::Adjust(m) => Some(m.variant_id),
            Movement::Transfer(m) => Some(m.variant_id),
            Movement::Reserve(m) => Some(m.variant_id),
            Movement::Release(_) => None,
            Movement::Ship(m) => Some(m.variant_id),
        }
    }

    /// Locations named directly by the request, origin before destination.
    pub fn location_ids(&self) -> Vec<LocationId> {
        match self {
            Movement::Receive(m) => vec![m.location_id],
            Movement::Adjust(m) => vec![m.location_id],
            Movement::Transfer(m) => vec![m.from_location_id, m.to_location_id],
            Movement::Reserve(m) => vec![m.location_id],
            Movement::Release(_) => vec![],
            Movement::Ship(m) => vec![m.location_id],
        }
    }

    /// Input checks that need no stored state.
    ///
    /// Reservation expiry depends on the clock and is checked when the hold is
    /// decided, so a retry of an applied reserve still finds its twin.
    pub fn validate(&self) -> Result<(), InventoryError> {
        match self {
            Movement::Receive(m) => ensure_positive(m.quantity),
            Movement::Adjust(m) => {
                if m.new_on_hand < Decimal::ZERO {
                    return Err(InventoryError::InvalidQuantity {
                        quantity: m.new_on_hand,
                    });
                }
                ensure_scale(m.new_on_hand)
            }
            Movement::Transfer(m) => {
                ensure_positive(m.quantity)?;
                if m.from_location_id == m.to_location_id {
                    return Err(InventoryError::SameLocationTransfer);
                }
                Ok(())
            }
            Movement::Reserve(m) => ensure_positive(m.quantity),
            Movement::Release(_) => Ok(()),
            Movement::Ship(m) => ensure_positive(m.quantity),
        }
    }

    /// Balance keys touched, in request order (origin before destination).
    ///
    /// Release needs the reservation to know where its hold lives.
    pub fn balance_keys(
        &self,
        reservation: Option<&Reservation>,
    ) -> Result<Vec<BalanceKey>, InventoryError> {
        let org = self.organization_id();
        let keys = match self {
            Movement::Receive(m) => vec![BalanceKey::new(org, m.location_id, m.variant_id)],
            Movement::Adjust(m) => vec![BalanceKey::new(org, m.location_id, m.variant_id)],
            Movement::Transfer(m) => vec![
                BalanceKey::new(org, m.from_location_id, m.variant_id),
                BalanceKey::new(org, m.to_location_id, m.variant_id),
            ],
            Movement::Reserve(m) => vec![BalanceKey::new(org, m.location_id, m.variant_id)],
            Movement::Release(_) => {
                let r = reservation
                    .ok_or_else(|| InventoryError::invariant("release requires its reservation"))?;
                vec![r.key()]
            }
            Movement::Ship(m) => vec![BalanceKey::new(org, m.location_id, m.variant_id)],
        };
        Ok(keys)
    }
}

/// Sorted, de-duplicated keys: the order in which rows must be locked.
pub fn lock_order(keys: &[BalanceKey]) -> Vec<BalanceKey> {
    let mut ordered = keys.to_vec();
    ordered.sort();
    ordered.dedup();
    ordered
}

/// Rows read under lock, in the order of `Movement::balance_keys`.
#[derive(Debug, Clone, PartialEq)]
pub struct LockedState {
    pub balances: Vec<Balance>,
    pub reservation: Option<Reservation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReservationWrite {
    Insert(Reservation),
    Update(Reservation),
}

impl ReservationWrite {
    pub fn reservation(&self) -> &Reservation {
        match self {
            ReservationWrite::Insert(r) | ReservationWrite::Update(r) => r,
        }
    }

    pub fn into_reservation(self) -> Reservation {
        match self {
            ReservationWrite::Insert(r) | ReservationWrite::Update(r) => r,
        }
    }
}

/// Everything one movement writes, committed together or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct MovementWrites {
    /// Updated balances in request order.
    pub balances: Vec<Balance>,
    pub entries: Vec<LedgerEntry>,
    pub reservation: Option<ReservationWrite>,
    pub event: InventoryEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Apply(MovementWrites),
    /// Nothing to write (adjusting to the current on-hand).
    Unchanged(Balance),
}

/// Decide the writes for `movement` given the locked rows.
pub fn decide(
    movement: &Movement,
    state: LockedState,
    now: DateTime<Utc>,
) -> Result<Decision, InventoryError> {
    movement.validate()?;

    let expected = movement.balance_keys(state.reservation.as_ref())?;
    let actual: Vec<BalanceKey> = state.balances.iter().map(Balance::key).collect();
    if actual != expected {
        return Err(InventoryError::invariant(format!(
            "{} locked the wrong balances",
            movement.name()
        )));
    }

    let LockedState {
        mut balances,
        reservation,
    } = state;

    match movement {
        Movement::Receive(cmd) => decide_receive(cmd, balances.remove(0), now),
        Movement::Adjust(cmd) => decide_adjust(cmd, balances.remove(0), now),
        Movement::Transfer(cmd) => {
            let destination = balances.remove(1);
            let origin = balances.remove(0);
            decide_transfer(cmd, origin, destination, now)
        }
        Movement::Reserve(cmd) => decide_reserve(cmd, balances.remove(0), now),
        Movement::Release(cmd) => {
            let reservation = reservation
                .ok_or_else(|| InventoryError::invariant("release requires its reservation"))?;
            decide_release(cmd, balances.remove(0), reservation, now)
        }
        Movement::Ship(cmd) => decide_ship(cmd, balances.remove(0), reservation, now),
    }
}

fn decide_receive(
    cmd: &Receive,
    mut balance: Balance,
    now: DateTime<Utc>,
) -> Result<Decision, InventoryError> {
    let entry = LedgerEntry::record(
        balance.key(),
        MovementType::Receive,
        cmd.quantity,
        Decimal::ZERO,
        &cmd.meta,
        None,
        now,
    )?;
    balance.apply_delta(cmd.quantity, Decimal::ZERO, entry.occurred_at, now)?;

    let event = InventoryEvent::StockReceived(StockReceived {
        organization_id: cmd.organization_id,
        location_id: cmd.location_id,
        variant_id: cmd.variant_id,
        quantity: cmd.quantity,
        on_hand: balance.on_hand,
        entry_id: entry.id,
        deduplication_key: entry.deduplication_key.clone(),
        occurred_at: entry.occurred_at,
    });

    Ok(Decision::Apply(MovementWrites {
        balances: vec![balance],
        entries: vec![entry],
        reservation: None,
        event,
    }))
}

fn decide_adjust(
    cmd: &Adjust,
    mut balance: Balance,
    now: DateTime<Utc>,
) -> Result<Decision, InventoryError> {
    if cmd.new_on_hand < balance.reserved {
        return Err(InventoryError::BelowReserved {
            requested: cmd.new_on_hand,
            reserved: balance.reserved,
        });
    }

    let previous_on_hand = balance.on_hand;
    let delta = cmd.new_on_hand - previous_on_hand;
    if delta.is_zero() {
        return Ok(Decision::Unchanged(balance));
    }

    let entry = LedgerEntry::record(
        balance.key(),
        MovementType::Adjust,
        delta,
        Decimal::ZERO,
        &cmd.meta,
        None,
        now,
    )?;
    balance.apply_delta(delta, Decimal::ZERO, entry.occurred_at, now)?;

    let event = InventoryEvent::StockAdjusted(StockAdjusted {
        organization_id: cmd.organization_id,
        location_id: cmd.location_id,
        variant_id: cmd.variant_id,
        previous_on_hand,
        on_hand: balance.on_hand,
        delta,
        entry_id: entry.id,
        deduplication_key: entry.deduplication_key.clone(),
        occurred_at: entry.occurred_at,
    });

    Ok(Decision::Apply(MovementWrites {
        balances: vec![balance],
        entries: vec![entry],
        reservation: None,
        event,
    }))
}

fn decide_transfer(
    cmd: &Transfer,
    mut origin: Balance,
    mut destination: Balance,
    now: DateTime<Utc>,
) -> Result<Decision, InventoryError> {
    let available = origin.available();
    if available < cmd.quantity {
        return Err(InventoryError::InsufficientStock {
            available,
            requested: cmd.quantity,
        });
    }

    let out = LedgerEntry::record(
        origin.key(),
        MovementType::TransferOut,
        -cmd.quantity,
        Decimal::ZERO,
        &cmd.meta,
        None,
        now,
    )?;
    let inbound = LedgerEntry::record(
        destination.key(),
        MovementType::TransferIn,
        cmd.quantity,
        Decimal::ZERO,
        &cmd.meta,
        None,
        now,
    )?;
    origin.apply_delta(-cmd.quantity, Decimal::ZERO, out.occurred_at, now)?;
    destination.apply_delta(cmd.quantity, Decimal::ZERO, inbound.occurred_at, now)?;

    let event = InventoryEvent::StockTransferred(StockTransferred {
        organization_id: cmd.organization_id,
        variant_id: cmd.variant_id,
        from_location_id: cmd.from_location_id,
        to_location_id: cmd.to_location_id,
        quantity: cmd.quantity,
        out_entry_id: out.id,
        in_entry_id: inbound.id,
        deduplication_key: out.deduplication_key.clone(),
        occurred_at: out.occurred_at,
    });

    Ok(Decision::Apply(MovementWrites {
        balances: vec![origin, destination],
        entries: vec![out, inbound],
        reservation: None,
        event,
    }))
}

fn decide_reserve(
    cmd: &Reserve,
    mut balance: Balance,
    now: DateTime<Utc>,
) -> Result<Decision, InventoryError> {
    if let Some(expires_at) = cmd.expires_at.filter(|at| *at <= now) {
        return Err(InventoryError::ExpiryInPast { expires_at });
    }

    let available = balance.available();
    if available < cmd.quantity {
        return Err(InventoryError::InsufficientStock {
            available,
            requested: cmd.quantity,
        });
    }

    let reservation_id = ReservationId::new();
    let entry = LedgerEntry::record(
        balance.key(),
        MovementType::Reserve,
        Decimal::ZERO,
        cmd.quantity,
        &cmd.meta,
        Some(reservation_id),
        now,
    )?;
    balance.apply_delta(Decimal::ZERO, cmd.quantity, entry.occurred_at, now)?;

    let reservation = Reservation {
        id: reservation_id,
        organization_id: cmd.organization_id,
        location_id: cmd.location_id,
        variant_id: cmd.variant_id,
        quantity: cmd.quantity,
        status: ReservationStatus::Active,
        reserved_at: entry.occurred_at,
        expires_at: cmd.expires_at,
        source: cmd.meta.source.clone(),
        deduplication_key: entry.deduplication_key.clone(),
        metadata: cmd.meta.metadata.clone(),
        created_entry_id: Some(entry.id),
        closed_entry_id: None,
        closed_at: None,
    };

    let event = InventoryEvent::StockReserved(StockReserved {
        organization_id: cmd.organization_id,
        location_id: cmd.location_id,
        variant_id: cmd.variant_id,
        reservation_id,
        quantity: cmd.quantity,
        expires_at: cmd.expires_at,
        entry_id: entry.id,
        deduplication_key: entry.deduplication_key.clone(),
        occurred_at: entry.occurred_at,
    });

    Ok(Decision::Apply(MovementWrites {
        balances: vec![balance],
        entries: vec![entry],
        reservation: Some(ReservationWrite::Insert(reservation)),
        event,
    }))
}

fn decide_release(
    cmd: &Release,
    mut balance: Balance,
    mut reservation: Reservation,
    now: DateTime<Utc>,
) -> Result<Decision, InventoryError> {
    if reservation.id != cmd.reservation_id || reservation.organization_id != cmd.organization_id {
        return Err(InventoryError::invariant("release locked the wrong reservation"));
    }
    reservation.ensure_active()?;

    let entry = LedgerEntry::record(
        balance.key(),
        MovementType::Release,
        Decimal::ZERO,
        -reservation.quantity,
        &cmd.meta,
        Some(reservation.id),
        now,
    )?;
    balance.apply_delta(Decimal::ZERO, -reservation.quantity, entry.occurred_at, now)?;
    reservation.cancel(entry.id, now)?;

    let event = InventoryEvent::ReservationReleased(ReservationReleased {
        organization_id: cmd.organization_id,
        location_id: reservation.location_id,
        variant_id: reservation.variant_id,
        reservation_id: reservation.id,
        quantity: reservation.quantity,
        entry_id: entry.id,
        deduplication_key: entry.deduplication_key.clone(),
        occurred_at: entry.occurred_at,
    });

    Ok(Decision::Apply(MovementWrites {
        balances: vec![balance],
        entries: vec![entry],
        reservation: Some(ReservationWrite::Update(reservation)),
        event,
    }))
}

fn decide_ship(
    cmd: &Ship,
    mut balance: Balance,
    reservation: Option<Reservation>,
    now: DateTime<Utc>,
) -> Result<Decision, InventoryError> {
    let mut released = Decimal::ZERO;
    let reservation = match (cmd.reservation_id, reservation) {
        (None, _) => {
            let available = balance.available();
            if available < cmd.quantity {
                return Err(InventoryError::InsufficientStock {
                    available,
                    requested: cmd.quantity,
                });
            }
            None
        }
        (Some(id), Some(r)) => {
            if r.id != id || r.organization_id != cmd.organization_id {
                return Err(InventoryError::invariant("ship locked the wrong reservation"));
            }
            r.ensure_active()?;
            if r.key() != balance.key() {
                return Err(InventoryError::ReservationMismatch { reservation_id: r.id });
            }
            if r.quantity < cmd.quantity {
                return Err(InventoryError::ReservationQuantityExceeded {
                    held: r.quantity,
                    requested: cmd.quantity,
                });
            }
            // Stock held by this reservation counts as available to it.
            let available = balance.on_hand - (balance.reserved - r.quantity);
            if available < cmd.quantity {
                return Err(InventoryError::InsufficientStock {
                    available,
                    requested: cmd.quantity,
                });
            }
            released = cmd.quantity;
            Some(r)
        }
        (Some(_), None) => {
            return Err(InventoryError::invariant("ship requires its reservation"));
        }
    };

    let entry = LedgerEntry::record(
        balance.key(),
        MovementType::Ship,
        -cmd.quantity,
        -released,
        &cmd.meta,
        reservation.as_ref().map(|r| r.id),
        now,
    )?;
    balance.apply_delta(-cmd.quantity, -released, entry.occurred_at, now)?;

    let reservation = match reservation {
        Some(mut r) => {
            r.consume(entry.id, now)?;
            Some(ReservationWrite::Update(r))
        }
        None => None,
    };

    let event = InventoryEvent::StockShipped(StockShipped {
        organization_id: cmd.organization_id,
        location_id: cmd.location_id,
        variant_id: cmd.variant_id,
        quantity: cmd.quantity,
        reservation_id: reservation.as_ref().map(|w| w.reservation().id),
        released_reserved: released,
        entry_id: entry.id,
        deduplication_key: entry.deduplication_key.clone(),
        occurred_at: entry.occurred_at,
    });

    Ok(Decision::Apply(MovementWrites {
        balances: vec![balance],
        entries: vec![entry],
        reservation,
        event,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    /// Minimal in-process "database" driving `decide` the way a store does.
    struct World {
        org: OrganizationId,
        variant: VariantId,
        locations: Vec<LocationId>,
        balances: HashMap<BalanceKey, Balance>,
        reservations: HashMap<ReservationId, Reservation>,
        entries: Vec<LedgerEntry>,
        events: Vec<InventoryEvent>,
    }

    impl World {
        fn new(location_count: usize) -> Self {
            Self {
                org: OrganizationId::new(),
                variant: VariantId::new(),
                locations: (0..location_count).map(|_| LocationId::new()).collect(),
                balances: HashMap::new(),
                reservations: HashMap::new(),
                entries: Vec::new(),
                events: Vec::new(),
            }
        }

        fn key(&self, location: usize) -> BalanceKey {
            BalanceKey::new(self.org, self.locations[location], self.variant)
        }

        fn balance(&self, location: usize) -> Balance {
            let key = self.key(location);
            self.balances
                .get(&key)
                .cloned()
                .unwrap_or_else(|| Balance::empty(key, Utc::now()))
        }

        fn apply(&mut self, movement: Movement) -> Result<Decision, InventoryError> {
            let now = Utc::now();
            let reservation = movement
                .reservation_id()
                .and_then(|id| self.reservations.get(&id).cloned());
            let keys = movement.balance_keys(reservation.as_ref())?;
            let balances = keys
                .iter()
                .map(|k| {
                    self.balances
                        .get(k)
                        .cloned()
                        .unwrap_or_else(|| Balance::empty(*k, now))
                })
                .collect();

            let decision = decide(
                &movement,
                LockedState {
                    balances,
                    reservation,
                },
                now,
            )?;

            if let Decision::Apply(writes) = &decision {
                for b in &writes.balances {
                    self.balances.insert(b.key(), b.clone());
                }
                self.entries.extend(writes.entries.iter().cloned());
                if let Some(w) = &writes.reservation {
                    let r = w.reservation().clone();
                    self.reservations.insert(r.id, r);
                }
                self.events.push(writes.event.clone());
            }
            Ok(decision)
        }

        fn receive(&mut self, location: usize, quantity: Decimal) -> Result<Decision, InventoryError> {
            let m = Receive {
                organization_id: self.org,
                location_id: self.locations[location],
                variant_id: self.variant,
                quantity,
                meta: MovementMeta::keyed(format!("rcv-{}", ReservationId::new())),
            };
            self.apply(m.into())
        }

        fn reserve(&mut self, location: usize, quantity: Decimal) -> Result<ReservationId, InventoryError> {
            let m = Reserve {
                organization_id: self.org,
                location_id: self.locations[location],
                variant_id: self.variant,
                quantity,
                expires_at: None,
                meta: MovementMeta::keyed(format!("rsv-{}", ReservationId::new())),
            };
            match self.apply(m.into())? {
                Decision::Apply(w) => Ok(w.reservation.expect("reservation").reservation().id),
                Decision::Unchanged(_) => panic!("reserve never no-ops"),
            }
        }

        fn ship(
            &mut self,
            location: usize,
            quantity: Decimal,
            reservation_id: Option<ReservationId>,
        ) -> Result<Decision, InventoryError> {
            let m = Ship {
                organization_id: self.org,
                location_id: self.locations[location],
                variant_id: self.variant,
                quantity,
                reservation_id,
                meta: MovementMeta::keyed(format!("shp-{}", ReservationId::new())),
            };
            self.apply(m.into())
        }

        fn release(&mut self, reservation_id: ReservationId) -> Result<Decision, InventoryError> {
            let m = Release {
                organization_id: self.org,
                reservation_id,
                meta: MovementMeta::keyed(format!("rel-{}", ReservationId::new())),
            };
            self.apply(m.into())
        }

        fn adjust(&mut self, location: usize, new_on_hand: Decimal) -> Result<Decision, InventoryError> {
            let m = Adjust {
                organization_id: self.org,
                location_id: self.locations[location],
                variant_id: self.variant,
                new_on_hand,
                meta: MovementMeta::keyed(format!("adj-{}", ReservationId::new())),
            };
            self.apply(m.into())
        }

        fn transfer(&mut self, from: usize, to: usize, quantity: Decimal) -> Result<Decision, InventoryError> {
            let m = Transfer {
                organization_id: self.org,
                variant_id: self.variant,
                from_location_id: self.locations[from],
                to_location_id: self.locations[to],
                quantity,
                meta: MovementMeta::keyed(format!("xfr-{}", ReservationId::new())),
            };
            self.apply(m.into())
        }

        fn assert_consistent(&self) {
            for (key, balance) in &self.balances {
                balance.check_invariant().unwrap();

                let on_hand: Decimal = self
                    .entries
                    .iter()
                    .filter(|e| e.key() == *key)
                    .map(|e| e.delta_on_hand)
                    .sum();
                let reserved: Decimal = self
                    .entries
                    .iter()
                    .filter(|e| e.key() == *key)
                    .map(|e| e.delta_reserved)
                    .sum();
                let held: Decimal = self
                    .reservations
                    .values()
                    .filter(|r| r.key() == *key && r.is_active())
                    .map(|r| r.quantity)
                    .sum();

                assert_eq!(balance.on_hand, on_hand, "ledger replays on_hand");
                assert_eq!(balance.reserved, reserved, "ledger replays reserved");
                // A partial ship leaves the unshipped part of its hold in reserved.
                assert!(balance.reserved >= held, "reserved covers active reservations");
            }
        }
    }

    #[test]
    fn receive_on_empty_balance() {
        let mut w = World::new(1);
        let decision = w.receive(0, dec!(10)).unwrap();

        let Decision::Apply(writes) = decision else {
            panic!("expected writes");
        };
        assert_eq!(writes.balances[0].on_hand, dec!(10));
        assert_eq!(writes.balances[0].reserved, Decimal::ZERO);
        assert_eq!(writes.entries.len(), 1);
        assert_eq!(writes.entries[0].delta_on_hand, dec!(10));
        assert_eq!(writes.entries[0].movement_type, MovementType::Receive);
    }

    #[test]
    fn reserve_then_ship_against_reservation_consumes_it() {
        let mut w = World::new(1);
        w.receive(0, dec!(10)).unwrap();
        let rid = w.reserve(0, dec!(4)).unwrap();
        w.ship(0, dec!(4), Some(rid)).unwrap();

        let b = w.balance(0);
        assert_eq!((b.on_hand, b.reserved), (dec!(6), Decimal::ZERO));
        assert_eq!(w.reservations[&rid].status, ReservationStatus::Consumed);

        let ship = w.entries.last().unwrap();
        assert_eq!((ship.delta_on_hand, ship.delta_reserved), (dec!(-4), dec!(-4)));
        assert_eq!(ship.reservation_id, Some(rid));
        w.assert_consistent();
    }

    #[test]
    fn second_reserve_beyond_available_fails() {
        let mut w = World::new(1);
        w.receive(0, dec!(10)).unwrap();
        w.reserve(0, dec!(8)).unwrap();

        let err = w.reserve(0, dec!(5)).unwrap_err();
        assert_eq!(
            err,
            InventoryError::InsufficientStock {
                available: dec!(2),
                requested: dec!(5)
            }
        );
        let b = w.balance(0);
        assert_eq!((b.on_hand, b.reserved), (dec!(10), dec!(8)));
    }

    #[test]
    fn adjust_below_reserved_fails() {
        let mut w = World::new(1);
        w.receive(0, dec!(10)).unwrap();
        w.reserve(0, dec!(8)).unwrap();

        let err = w.adjust(0, dec!(7)).unwrap_err();
        assert_eq!(
            err,
            InventoryError::BelowReserved {
                requested: dec!(7),
                reserved: dec!(8)
            }
        );
        assert_eq!(w.balance(0).on_hand, dec!(10));
    }

    #[test]
    fn adjust_to_current_value_is_unchanged() {
        let mut w = World::new(1);
        w.receive(0, dec!(10)).unwrap();
        let before = w.balance(0);

        let decision = w.adjust(0, dec!(10.000)).unwrap();
        assert_eq!(decision, Decision::Unchanged(before));
        assert_eq!(w.entries.len(), 1);
        assert_eq!(w.events.len(), 1);
    }

    #[test]
    fn transfer_moves_available_stock_with_paired_entries() {
        let mut w = World::new(2);
        w.receive(0, dec!(10)).unwrap();
        w.reserve(0, dec!(2)).unwrap();
        w.transfer(0, 1, dec!(5)).unwrap();

        let a = w.balance(0);
        let b = w.balance(1);
        assert_eq!((a.on_hand, a.reserved), (dec!(5), dec!(2)));
        assert_eq!((b.on_hand, b.reserved), (dec!(5), Decimal::ZERO));

        let legs: Vec<&LedgerEntry> = w
            .entries
            .iter()
            .filter(|e| {
                matches!(e.movement_type, MovementType::TransferOut | MovementType::TransferIn)
            })
            .collect();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].deduplication_key, legs[1].deduplication_key);
        w.assert_consistent();
    }

    #[test]
    fn transfer_cannot_move_reserved_stock() {
        let mut w = World::new(2);
        w.receive(0, dec!(10)).unwrap();
        w.reserve(0, dec!(6)).unwrap();
        let err = w.transfer(0, 1, dec!(5)).unwrap_err();
        assert_eq!(
            err,
            InventoryError::InsufficientStock {
                available: dec!(4),
                requested: dec!(5)
            }
        );
    }

    #[test]
    fn partial_ship_reduces_reserved_by_the_shipped_quantity() {
        let mut w = World::new(1);
        w.receive(0, dec!(10)).unwrap();
        let rid = w.reserve(0, dec!(4)).unwrap();
        w.ship(0, dec!(3), Some(rid)).unwrap();

        let b = w.balance(0);
        assert_eq!((b.on_hand, b.reserved), (dec!(7), dec!(1)));
        let ship = w.entries.last().unwrap();
        assert_eq!((ship.delta_on_hand, ship.delta_reserved), (dec!(-3), dec!(-3)));
        assert_eq!(w.reservations[&rid].status, ReservationStatus::Consumed);
        w.assert_consistent();
    }

    #[test]
    fn ship_more_than_reserved_fails() {
        let mut w = World::new(1);
        w.receive(0, dec!(10)).unwrap();
        let rid = w.reserve(0, dec!(4)).unwrap();
        let err = w.ship(0, dec!(5), Some(rid)).unwrap_err();
        assert_eq!(
            err,
            InventoryError::ReservationQuantityExceeded {
                held: dec!(4),
                requested: dec!(5)
            }
        );
    }

    #[test]
    fn ship_against_reservation_elsewhere_is_a_mismatch() {
        let mut w = World::new(2);
        w.receive(0, dec!(10)).unwrap();
        w.receive(1, dec!(10)).unwrap();
        let rid = w.reserve(0, dec!(4)).unwrap();
        let err = w.ship(1, dec!(4), Some(rid)).unwrap_err();
        assert_eq!(err, InventoryError::ReservationMismatch { reservation_id: rid });
    }

    #[test]
    fn ship_without_reservation_respects_other_holds() {
        let mut w = World::new(1);
        w.receive(0, dec!(10)).unwrap();
        w.reserve(0, dec!(8)).unwrap();
        assert!(matches!(
            w.ship(0, dec!(3), None),
            Err(InventoryError::InsufficientStock { .. })
        ));
        w.ship(0, dec!(2), None).unwrap();
        let b = w.balance(0);
        assert_eq!((b.on_hand, b.reserved), (dec!(8), dec!(8)));
    }

    #[test]
    fn terminal_reservation_rejects_release_and_ship() {
        let mut w = World::new(1);
        w.receive(0, dec!(10)).unwrap();
        let rid = w.reserve(0, dec!(4)).unwrap();
        w.release(rid).unwrap();
        let after_release = w.balance(0);

        let again = w.release(rid).unwrap_err();
        assert_eq!(
            again,
            InventoryError::InvalidReservationState {
                reservation_id: rid,
                status: ReservationStatus::Cancelled
            }
        );
        assert!(matches!(
            w.ship(0, dec!(1), Some(rid)),
            Err(InventoryError::InvalidReservationState { .. })
        ));
        assert_eq!(w.balance(0), after_release);
        w.assert_consistent();
    }

    #[test]
    fn validation_rejects_bad_input_before_state() {
        let org = OrganizationId::new();
        let loc = LocationId::new();
        let variant = VariantId::new();

        let zero = Movement::from(Receive {
            organization_id: org,
            location_id: loc,
            variant_id: variant,
            quantity: Decimal::ZERO,
            meta: MovementMeta::keyed("k"),
        });
        assert_eq!(
            zero.validate(),
            Err(InventoryError::InvalidQuantity {
                quantity: Decimal::ZERO
            })
        );

        let same = Movement::from(Transfer {
            organization_id: org,
            variant_id: variant,
            from_location_id: loc,
            to_location_id: loc,
            quantity: dec!(1),
            meta: MovementMeta::keyed("k"),
        });
        assert_eq!(same.validate(), Err(InventoryError::SameLocationTransfer));

        let too_precise = Movement::from(Receive {
            organization_id: org,
            location_id: loc,
            variant_id: variant,
            quantity: dec!(0.00001),
            meta: MovementMeta::keyed("k"),
        });
        assert!(matches!(
            too_precise.validate(),
            Err(InventoryError::Domain(DomainError::Validation(_)))
        ));
    }

    #[test]
    fn expiry_is_checked_when_the_hold_is_decided() {
        let mut world = World::new(1);
        world.receive(0, dec!(5)).unwrap();

        let stale = Movement::from(Reserve {
            organization_id: world.org,
            location_id: world.locations[0],
            variant_id: world.variant,
            quantity: dec!(1),
            expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            meta: MovementMeta::keyed("k"),
        });
        assert_eq!(stale.validate(), Ok(()));
        assert!(matches!(
            world.apply(stale),
            Err(InventoryError::ExpiryInPast { .. })
        ));
        assert_eq!(world.balance(0).reserved, Decimal::ZERO);
    }

    #[test]
    fn deduplication_keys_are_trimmed_and_bounded() {
        assert_eq!(normalize_deduplication_key("  "), Ok(None));
        assert_eq!(
            normalize_deduplication_key(" order-7 "),
            Ok(Some("order-7".to_string()))
        );
        let long = "x".repeat(MAX_DEDUPLICATION_KEY_LEN + 1);
        assert!(normalize_deduplication_key(&long).is_err());
    }

    #[test]
    fn lock_order_sorts_and_dedups() {
        let org = OrganizationId::new();
        let variant = VariantId::new();
        let a = BalanceKey::new(org, LocationId::new(), variant);
        let b = BalanceKey::new(org, LocationId::new(), variant);
        assert_eq!(lock_order(&[b, a, b]), lock_order(&[a, b]));
        assert_eq!(lock_order(&[b, a, b]).len(), 2);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Receive(usize, u32),
        Adjust(usize, u32),
        Transfer(usize, usize, u32),
        Reserve(usize, u32),
        Release(usize),
        Ship(usize, u32, Option<usize>),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize, 0..20u32).prop_map(|(l, q)| Op::Receive(l, q)),
            (0..3usize, 0..30u32).prop_map(|(l, q)| Op::Adjust(l, q)),
            (0..3usize, 0..3usize, 0..20u32).prop_map(|(a, b, q)| Op::Transfer(a, b, q)),
            (0..3usize, 0..20u32).prop_map(|(l, q)| Op::Reserve(l, q)),
            (0..8usize).prop_map(Op::Release),
            (0..3usize, 0..20u32, prop::option::of(0..8usize)).prop_map(|(l, q, r)| Op::Ship(l, q, r)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence of movements is attempted, every committed
        /// balance satisfies on_hand >= reserved >= 0, equals the replay of its
        /// ledger entries, and its reserved quantity covers its active
        /// reservations.
        #[test]
        fn invariants_hold_for_any_movement_sequence(ops in prop::collection::vec(op(), 1..60)) {
            let mut w = World::new(3);
            let mut reservation_ids: Vec<ReservationId> = Vec::new();

            for op in ops {
                match op {
                    Op::Receive(l, q) => { let _ = w.receive(l, Decimal::from(q)); }
                    Op::Adjust(l, q) => { let _ = w.adjust(l, Decimal::from(q)); }
                    Op::Transfer(a, b, q) => { let _ = w.transfer(a, b, Decimal::from(q)); }
                    Op::Reserve(l, q) => {
                        if let Ok(id) = w.reserve(l, Decimal::from(q)) {
                            reservation_ids.push(id);
                        }
                    }
                    Op::Release(i) => {
                        if let Some(id) = reservation_ids.get(i).copied() {
                            let _ = w.release(id);
                        }
                    }
                    Op::Ship(l, q, r) => {
                        let rid = r.and_then(|i| reservation_ids.get(i).copied());
                        let _ = w.ship(l, Decimal::from(q), rid);
                    }
                }
                w.assert_consistent();
            }
        }

        /// Property: transfers conserve total on-hand across locations.
        #[test]
        fn transfers_conserve_total_on_hand(
            seed in prop::collection::vec(0..50u32, 3),
            moves in prop::collection::vec((0..3usize, 0..3usize, 1..30u32), 1..30)
        ) {
            let mut w = World::new(3);
            for (l, q) in seed.iter().enumerate() {
                if *q > 0 {
                    w.receive(l, Decimal::from(*q)).unwrap();
                }
            }
            let total: Decimal = (0..3).map(|l| w.balance(l).on_hand).sum();

            for (a, b, q) in moves {
                let before_a = w.balance(a).on_hand;
                let before_b = w.balance(b).on_hand;
                if w.transfer(a, b, Decimal::from(q)).is_ok() {
                    prop_assert_eq!(w.balance(a).on_hand, before_a - Decimal::from(q));
                    prop_assert_eq!(w.balance(b).on_hand, before_b + Decimal::from(q));
                }
                let now_total: Decimal = (0..3).map(|l| w.balance(l).on_hand).sum();
                prop_assert_eq!(now_total, total);
            }
        }
    }
}

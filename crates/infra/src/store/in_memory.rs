use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use stockledger_core::{DomainError, LocationId, OrganizationId, ReservationId, VariantId};
use stockledger_events::OutboxEvent;
use stockledger_inventory::{
    Balance, BalanceKey, Decision, LedgerEntry, Location, LocationRegistry, LockedState, Movement,
    Reservation, ReservationWrite, VariantRef, decide,
};

use super::outbox_row;
use super::r#trait::{
    Applied, BalanceFilter, BalanceListing, LedgerQueries, LedgerStore, LocationStatus,
    OwnershipDirectory, PriorMovement,
};
use crate::error::{LedgerError, StoreError};

#[derive(Debug, Default)]
struct State {
    locations: LocationRegistry,
    variants: HashMap<VariantId, VariantRef>,
    balances: HashMap<BalanceKey, Balance>,
    entries: Vec<LedgerEntry>,
    reservations: HashMap<ReservationId, Reservation>,
    outbox: Vec<OutboxEvent>,
}

impl State {
    fn find_duplicate(&self, organization_id: OrganizationId, key: &str) -> Option<PriorMovement> {
        let entries: Vec<LedgerEntry> = self
            .entries
            .iter()
            .filter(|e| e.organization_id == organization_id && e.deduplication_key == key)
            .cloned()
            .collect();
        let reservation = self
            .reservations
            .values()
            .find(|r| r.organization_id == organization_id && r.deduplication_key == key)
            .cloned();

        if entries.is_empty() && reservation.is_none() {
            None
        } else {
            Some(PriorMovement {
                entries,
                reservation,
            })
        }
    }

    fn balance(&self, key: BalanceKey, now: DateTime<Utc>) -> Balance {
        self.balances
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Balance::empty(key, now))
    }
}

/// In-memory ledger store and ownership directory.
///
/// Intended for tests/dev. One mutex serializes every movement, which is
/// coarser than row locks but gives the same guarantees.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<State>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }

    pub fn register_location(&self, location: Location) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        state.locations.register(location)?;
        Ok(())
    }

    pub fn register_variant(&self, variant: VariantRef) -> Result<(), LedgerError> {
        if variant.sku.trim().is_empty() {
            return Err(DomainError::validation("variant sku must not be empty").into());
        }
        let mut state = self.lock()?;
        state.variants.insert(variant.id, variant);
        Ok(())
    }

    /// Every outbox row written so far, oldest first.
    pub fn outbox(&self) -> Result<Vec<OutboxEvent>, StoreError> {
        Ok(self.lock()?.outbox.clone())
    }

    /// Every ledger entry written so far, oldest first.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self.lock()?.entries.clone())
    }
}

#[async_trait::async_trait]
impl OwnershipDirectory for InMemoryLedgerStore {
    async fn variant_owner(
        &self,
        variant_id: VariantId,
    ) -> Result<Option<OrganizationId>, StoreError> {
        Ok(self
            .lock()?
            .variants
            .get(&variant_id)
            .map(|v| v.organization_id))
    }

    async fn location_status(
        &self,
        location_id: LocationId,
    ) -> Result<Option<LocationStatus>, StoreError> {
        Ok(self
            .lock()?
            .locations
            .get(location_id)
            .map(|l| LocationStatus {
                organization_id: l.organization_id,
                is_active: l.is_active,
            }))
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn find_duplicate(
        &self,
        organization_id: OrganizationId,
        deduplication_key: &str,
    ) -> Result<Option<PriorMovement>, StoreError> {
        Ok(self.lock()?.find_duplicate(organization_id, deduplication_key))
    }

    async fn reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<Reservation>, StoreError> {
        Ok(self.lock()?.reservations.get(&reservation_id).cloned())
    }

    async fn balances(
        &self,
        keys: &[BalanceKey],
        now: DateTime<Utc>,
    ) -> Result<Vec<Balance>, StoreError> {
        let state = self.lock()?;
        Ok(keys.iter().map(|k| state.balance(*k, now)).collect())
    }

    async fn apply(&self, movement: &Movement, now: DateTime<Utc>) -> Result<Applied, LedgerError> {
        let mut state = self.lock()?;

        let organization_id = movement.organization_id();
        if let Some(prior) = state.find_duplicate(organization_id, movement.deduplication_key()) {
            return Ok(Applied::Duplicate(prior));
        }

        let reservation = match movement.reservation_id() {
            Some(id) => state
                .reservations
                .get(&id)
                .filter(|r| r.organization_id == organization_id)
                .cloned(),
            None => None,
        };
        let keys = movement.balance_keys(reservation.as_ref())?;
        let balances = keys.iter().map(|k| state.balance(*k, now)).collect();

        let writes = match decide(
            movement,
            LockedState {
                balances,
                reservation,
            },
            now,
        )? {
            Decision::Unchanged(balance) => return Ok(Applied::Unchanged { balance }),
            Decision::Apply(writes) => writes,
        };

        // Build everything fallible before touching state.
        let outbox = outbox_row(movement, &writes.event, now)?;

        for balance in &writes.balances {
            state.balances.insert(balance.key(), balance.clone());
        }
        state.entries.extend(writes.entries.iter().cloned());
        let reservation = writes.reservation.map(ReservationWrite::into_reservation);
        if let Some(r) = &reservation {
            state.reservations.insert(r.id, r.clone());
        }
        state.outbox.push(outbox.clone());

        Ok(Applied::Written {
            balances: writes.balances,
            entries: writes.entries,
            reservation,
            outbox,
        })
    }
}

#[async_trait::async_trait]
impl LedgerQueries for InMemoryLedgerStore {
    async fn list_balances(
        &self,
        organization_id: OrganizationId,
        filter: &BalanceFilter,
    ) -> Result<Vec<BalanceListing>, StoreError> {
        let state = self.lock()?;
        let search = filter.search.as_deref().unwrap_or("");

        let mut listings: Vec<BalanceListing> = state
            .balances
            .values()
            .filter(|b| b.organization_id == organization_id)
            .filter(|b| filter.location_id.is_none_or(|l| b.location_id == l))
            .filter_map(|b| {
                let variant = state.variants.get(&b.variant_id)?;
                if !variant.matches(search) {
                    return None;
                }
                let location = state.locations.get(b.location_id)?;
                Some(BalanceListing {
                    balance: b.clone(),
                    location_code: location.code.clone(),
                    sku: variant.sku.clone(),
                    variant_name: variant.name.clone(),
                })
            })
            .collect();

        listings.sort_by(|a, b| {
            a.location_code
                .cmp(&b.location_code)
                .then_with(|| a.sku.cmp(&b.sku))
        });
        Ok(listings)
    }

    async fn recent_entries(
        &self,
        organization_id: OrganizationId,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .entries
            .iter()
            .rev()
            .filter(|e| e.organization_id == organization_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn active_reservations(
        &self,
        organization_id: OrganizationId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StoreError> {
        let state = self.lock()?;
        let mut active: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.organization_id == organization_id && r.is_active() && !r.is_expired(now))
            .cloned()
            .collect();
        active.sort_by_key(|r| (r.reserved_at, r.id));
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stockledger_inventory::{MovementMeta, Receive};

    fn seeded() -> (InMemoryLedgerStore, OrganizationId, Location, VariantRef) {
        let store = InMemoryLedgerStore::new();
        let org = OrganizationId::new();
        let location = Location::new(org, "MAIN", "Main warehouse").as_default();
        let variant = VariantRef::new(org, "MUG-01", "Coffee mug");
        store.register_location(location.clone()).unwrap();
        store.register_variant(variant.clone()).unwrap();
        (store, org, location, variant)
    }

    fn receive(org: OrganizationId, location: &Location, variant: &VariantRef, key: &str) -> Movement {
        Receive {
            organization_id: org,
            location_id: location.id,
            variant_id: variant.id,
            quantity: dec!(3),
            meta: MovementMeta::keyed(key),
        }
        .into()
    }

    #[tokio::test]
    async fn apply_writes_balance_entry_and_one_outbox_row() {
        let (store, org, location, variant) = seeded();
        let applied = store
            .apply(&receive(org, &location, &variant, "r-1"), Utc::now())
            .await
            .unwrap();

        let Applied::Written { balances, entries, outbox, .. } = applied else {
            panic!("expected a write");
        };
        assert_eq!(balances[0].on_hand, dec!(3));
        assert_eq!(entries.len(), 1);
        assert_eq!(outbox.event_type, "inventory.stock.received");
        assert_eq!(store.outbox().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn apply_detects_twin_inside_the_lock() {
        let (store, org, location, variant) = seeded();
        let movement = receive(org, &location, &variant, "r-1");
        store.apply(&movement, Utc::now()).await.unwrap();

        let again = store.apply(&movement, Utc::now()).await.unwrap();
        assert!(matches!(again, Applied::Duplicate(ref prior) if prior.entries.len() == 1));
        assert_eq!(store.entries().unwrap().len(), 1);
        assert_eq!(store.outbox().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deduplication_keys_are_scoped_per_organization() {
        let (store, org, location, variant) = seeded();
        store
            .apply(&receive(org, &location, &variant, "shared"), Utc::now())
            .await
            .unwrap();

        let other = OrganizationId::new();
        assert!(store.find_duplicate(other, "shared").await.unwrap().is_none());
        assert!(store.find_duplicate(org, "shared").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn balances_for_untouched_keys_are_empty() {
        let (store, org, location, variant) = seeded();
        let key = BalanceKey::new(org, location.id, variant.id);
        let balances = store.balances(&[key], Utc::now()).await.unwrap();
        assert_eq!(balances[0].on_hand, dec!(0));
        assert_eq!(balances[0].last_movement_at, None);
    }

    #[tokio::test]
    async fn directory_reports_owners() {
        let (store, org, location, variant) = seeded();
        assert_eq!(
            store.location_status(location.id).await.unwrap(),
            Some(LocationStatus {
                organization_id: org,
                is_active: true,
            })
        );
        assert_eq!(store.variant_owner(variant.id).await.unwrap(), Some(org));
        assert_eq!(store.variant_owner(VariantId::new()).await.unwrap(), None);
    }
}

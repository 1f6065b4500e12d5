use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{LocationId, OrganizationId, ReservationId, VariantId};
use stockledger_events::OutboxEvent;
use stockledger_inventory::{Balance, BalanceKey, LedgerEntry, Movement, Reservation};

use crate::error::{LedgerError, StoreError};

/// Owning organization of a location and whether it still accepts movements.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LocationStatus {
    pub organization_id: OrganizationId,
    pub is_active: bool,
}

/// Owner lookups for tenant isolation.
///
/// `None` means the reference does not exist.
#[async_trait::async_trait]
pub trait OwnershipDirectory: Send + Sync {
    async fn variant_owner(&self, variant_id: VariantId)
    -> Result<Option<OrganizationId>, StoreError>;

    async fn location_status(
        &self,
        location_id: LocationId,
    ) -> Result<Option<LocationStatus>, StoreError>;
}

/// What an earlier movement with the same deduplication key wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorMovement {
    pub entries: Vec<LedgerEntry>,
    pub reservation: Option<Reservation>,
}

impl PriorMovement {
    /// Balance keys the prior movement touched, in the order it wrote them.
    pub fn balance_keys(&self) -> Vec<BalanceKey> {
        let mut keys: Vec<BalanceKey> = Vec::new();
        let touched = self
            .entries
            .iter()
            .map(LedgerEntry::key)
            .chain(self.reservation.iter().map(Reservation::key));
        for key in touched {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

/// Result of [`LedgerStore::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Committed: balances in request order, entries, reservation and the outbox row.
    Written {
        balances: Vec<Balance>,
        entries: Vec<LedgerEntry>,
        reservation: Option<Reservation>,
        outbox: OutboxEvent,
    },
    /// Nothing to write; the transaction was rolled back.
    Unchanged { balance: Balance },
    /// A twin committed first.
    Duplicate(PriorMovement),
}

/// Transactional ledger storage.
///
/// `apply` must lock every balance row the movement touches (sorted by
/// `BalanceKey`), then its reservation, re-check the deduplication key, run
/// `stockledger_inventory::decide` and persist the result together with one
/// outbox row, all in one transaction.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find_duplicate(
        &self,
        organization_id: OrganizationId,
        deduplication_key: &str,
    ) -> Result<Option<PriorMovement>, StoreError>;

    /// Unscoped lookup; callers check the owner.
    async fn reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<Reservation>, StoreError>;

    /// Current balances for `keys`, in the same order. Missing rows come back empty.
    async fn balances(
        &self,
        keys: &[BalanceKey],
        now: DateTime<Utc>,
    ) -> Result<Vec<Balance>, StoreError>;

    async fn apply(&self, movement: &Movement, now: DateTime<Utc>) -> Result<Applied, LedgerError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceFilter {
    pub location_id: Option<LocationId>,
    /// Case-insensitive match on variant sku or name.
    pub search: Option<String>,
}

/// A balance with the labels a listing shows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceListing {
    #[serde(flatten)]
    pub balance: Balance,
    pub location_code: String,
    pub sku: String,
    pub variant_name: String,
}

/// Read-only projections over ledger state.
#[async_trait::async_trait]
pub trait LedgerQueries: Send + Sync {
    /// Sorted by location code, then sku.
    async fn list_balances(
        &self,
        organization_id: OrganizationId,
        filter: &BalanceFilter,
    ) -> Result<Vec<BalanceListing>, StoreError>;

    /// Most recent first.
    async fn recent_entries(
        &self,
        organization_id: OrganizationId,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Active reservations not expired at `now`, oldest first.
    async fn active_reservations(
        &self,
        organization_id: OrganizationId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StoreError>;
}

#[async_trait::async_trait]
impl<S> OwnershipDirectory for Arc<S>
where
    S: OwnershipDirectory + ?Sized,
{
    async fn variant_owner(
        &self,
        variant_id: VariantId,
    ) -> Result<Option<OrganizationId>, StoreError> {
        (**self).variant_owner(variant_id).await
    }

    async fn location_status(
        &self,
        location_id: LocationId,
    ) -> Result<Option<LocationStatus>, StoreError> {
        (**self).location_status(location_id).await
    }
}

#[async_trait::async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn find_duplicate(
        &self,
        organization_id: OrganizationId,
        deduplication_key: &str,
    ) -> Result<Option<PriorMovement>, StoreError> {
        (**self)
            .find_duplicate(organization_id, deduplication_key)
            .await
    }

    async fn reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<Reservation>, StoreError> {
        (**self).reservation(reservation_id).await
    }

    async fn balances(
        &self,
        keys: &[BalanceKey],
        now: DateTime<Utc>,
    ) -> Result<Vec<Balance>, StoreError> {
        (**self).balances(keys, now).await
    }

    async fn apply(&self, movement: &Movement, now: DateTime<Utc>) -> Result<Applied, LedgerError> {
        (**self).apply(movement, now).await
    }
}

#[async_trait::async_trait]
impl<S> LedgerQueries for Arc<S>
where
    S: LedgerQueries + ?Sized,
{
    async fn list_balances(
        &self,
        organization_id: OrganizationId,
        filter: &BalanceFilter,
    ) -> Result<Vec<BalanceListing>, StoreError> {
        (**self).list_balances(organization_id, filter).await
    }

    async fn recent_entries(
        &self,
        organization_id: OrganizationId,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        (**self).recent_entries(organization_id, limit).await
    }

    async fn active_reservations(
        &self,
        organization_id: OrganizationId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StoreError> {
        (**self).active_reservations(organization_id, now).await
    }
}

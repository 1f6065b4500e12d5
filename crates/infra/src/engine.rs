//! The ledger engine: the only writer of balances, ledger entries and
//! reservations.
//!
//! Every operation follows the same protocol:
//!
//! 1. validate the request,
//! 2. normalize the deduplication key (or apply the [`DedupKeyPolicy`]),
//! 3. check that every referenced variant, location and reservation belongs to
//!    the calling organization,
//! 4. look the key up; a hit returns the prior outcome without writing,
//! 5. hand the movement to [`LedgerStore::apply`], which locks, decides and
//!    writes in one transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use stockledger_core::OrganizationId;
use stockledger_inventory::{
    Adjust, Balance, InventoryError, LedgerEntry, Movement, Receive, ReferenceKind, Release,
    Reservation, Reserve, Ship, Transfer, normalize_deduplication_key,
};

use crate::config::{DEFAULT_RECENT_ENTRIES_LIMIT, DedupKeyPolicy, LedgerConfig};
use crate::error::LedgerError;
use crate::store::{
    Applied, BalanceFilter, BalanceListing, LedgerQueries, LedgerStore, OwnershipDirectory,
    PriorMovement,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Applied,
    /// The deduplication key was already used; nothing was written.
    Duplicate,
}

/// What a movement did (or, for a duplicate, what the first call did).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementOutcome {
    pub kind: OutcomeKind,
    pub deduplication_key: String,
    /// The caller sent no key and one was generated; retrying is not safe.
    pub key_synthesized: bool,
    /// Current balances of the touched keys, origin before destination.
    pub balances: Vec<Balance>,
    pub entries: Vec<LedgerEntry>,
    pub reservation: Option<Reservation>,
}

impl MovementOutcome {
    pub fn is_duplicate(&self) -> bool {
        self.kind == OutcomeKind::Duplicate
    }

    /// The first touched balance (the origin of a transfer).
    pub fn balance(&self) -> Option<&Balance> {
        self.balances.first()
    }
}

pub struct LedgerEngine<S, D> {
    store: S,
    directory: D,
    dedup_key_policy: DedupKeyPolicy,
    recent_entries_limit: u32,
}

impl<S, D> LedgerEngine<S, D>
where
    S: LedgerStore + LedgerQueries,
    D: OwnershipDirectory,
{
    pub fn new(store: S, directory: D) -> Self {
        Self {
            store,
            directory,
            dedup_key_policy: DedupKeyPolicy::default(),
            recent_entries_limit: DEFAULT_RECENT_ENTRIES_LIMIT,
        }
    }

    pub fn from_config(store: S, directory: D, config: &LedgerConfig) -> Self {
        Self::new(store, directory)
            .with_dedup_key_policy(config.dedup_key_policy)
            .with_recent_entries_limit(config.recent_entries_limit)
    }

    pub fn with_dedup_key_policy(mut self, policy: DedupKeyPolicy) -> Self {
        self.dedup_key_policy = policy;
        self
    }

    pub fn with_recent_entries_limit(mut self, limit: u32) -> Self {
        self.recent_entries_limit = limit.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    #[instrument(
        skip(self, cmd),
        fields(
            organization_id = %cmd.organization_id,
            location_id = %cmd.location_id,
            variant_id = %cmd.variant_id,
            quantity = %cmd.quantity
        ),
        err
    )]
    pub async fn receive(&self, cmd: Receive) -> Result<MovementOutcome, LedgerError> {
        self.execute(cmd.into()).await
    }

    #[instrument(
        skip(self, cmd),
        fields(
            organization_id = %cmd.organization_id,
            location_id = %cmd.location_id,
            variant_id = %cmd.variant_id,
            new_on_hand = %cmd.new_on_hand
        ),
        err
    )]
    pub async fn adjust(&self, cmd: Adjust) -> Result<MovementOutcome, LedgerError> {
        self.execute(cmd.into()).await
    }

    #[instrument(
        skip(self, cmd),
        fields(
            organization_id = %cmd.organization_id,
            variant_id = %cmd.variant_id,
            from_location_id = %cmd.from_location_id,
            to_location_id = %cmd.to_location_id,
            quantity = %cmd.quantity
        ),
        err
    )]
    pub async fn transfer(&self, cmd: Transfer) -> Result<MovementOutcome, LedgerError> {
        self.execute(cmd.into()).await
    }

    #[instrument(
        skip(self, cmd),
        fields(
            organization_id = %cmd.organization_id,
            location_id = %cmd.location_id,
            variant_id = %cmd.variant_id,
            quantity = %cmd.quantity
        ),
        err
    )]
    pub async fn reserve(&self, cmd: Reserve) -> Result<MovementOutcome, LedgerError> {
        self.execute(cmd.into()).await
    }

    #[instrument(
        skip(self, cmd),
        fields(
            organization_id = %cmd.organization_id,
            reservation_id = %cmd.reservation_id
        ),
        err
    )]
    pub async fn release(&self, cmd: Release) -> Result<MovementOutcome, LedgerError> {
        self.execute(cmd.into()).await
    }

    #[instrument(
        skip(self, cmd),
        fields(
            organization_id = %cmd.organization_id,
            location_id = %cmd.location_id,
            variant_id = %cmd.variant_id,
            quantity = %cmd.quantity,
            reservation_id = ?cmd.reservation_id
        ),
        err
    )]
    pub async fn ship(&self, cmd: Ship) -> Result<MovementOutcome, LedgerError> {
        self.execute(cmd.into()).await
    }

    /// Balances joined with location and variant labels.
    pub async fn list_balances(
        &self,
        organization_id: OrganizationId,
        filter: &BalanceFilter,
    ) -> Result<Vec<BalanceListing>, LedgerError> {
        Ok(self.store.list_balances(organization_id, filter).await?)
    }

    /// Most recent entries first, at most the configured limit.
    pub async fn recent_entries(
        &self,
        organization_id: OrganizationId,
        limit: Option<u32>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let limit = limit
            .unwrap_or(self.recent_entries_limit)
            .clamp(1, self.recent_entries_limit);
        Ok(self.store.recent_entries(organization_id, limit).await?)
    }

    /// Active reservations that have not expired yet.
    pub async fn active_reservations(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<Reservation>, LedgerError> {
        Ok(self
            .store
            .active_reservations(organization_id, Utc::now())
            .await?)
    }

    async fn execute(&self, mut movement: Movement) -> Result<MovementOutcome, LedgerError> {
        let now = Utc::now();
        movement.validate()?;
        let key_synthesized = self.resolve_deduplication_key(&mut movement)?;
        self.check_ownership(&movement).await?;

        let organization_id = movement.organization_id();
        let deduplication_key = movement.deduplication_key().to_string();

        if let Some(prior) = self
            .store
            .find_duplicate(organization_id, &deduplication_key)
            .await?
        {
            info!(movement = movement.name(), %deduplication_key, "duplicate movement, nothing written");
            return self
                .duplicate_outcome(prior, deduplication_key, key_synthesized, now)
                .await;
        }

        match self.store.apply(&movement, now).await? {
            Applied::Written {
                balances,
                entries,
                reservation,
                outbox,
            } => {
                info!(
                    movement = movement.name(),
                    %deduplication_key,
                    entries = entries.len(),
                    outbox_event_id = %outbox.id,
                    event_type = %outbox.event_type,
                    "movement applied"
                );
                Ok(MovementOutcome {
                    kind: OutcomeKind::Applied,
                    deduplication_key,
                    key_synthesized,
                    balances,
                    entries,
                    reservation,
                })
            }
            Applied::Unchanged { balance } => {
                debug!(movement = movement.name(), "on-hand already at target, nothing written");
                Ok(MovementOutcome {
                    kind: OutcomeKind::Applied,
                    deduplication_key,
                    key_synthesized,
                    balances: vec![balance],
                    entries: Vec::new(),
                    reservation: None,
                })
            }
            Applied::Duplicate(prior) => {
                info!(movement = movement.name(), %deduplication_key, "concurrent twin committed first, nothing written");
                self.duplicate_outcome(prior, deduplication_key, key_synthesized, now)
                    .await
            }
        }
    }

    /// Trim the caller's key, or apply the policy when there is none.
    fn resolve_deduplication_key(&self, movement: &mut Movement) -> Result<bool, InventoryError> {
        if let Some(key) = normalize_deduplication_key(movement.deduplication_key())? {
            movement.meta_mut().deduplication_key = key;
            return Ok(false);
        }
        match self.dedup_key_policy {
            DedupKeyPolicy::Require => Err(InventoryError::MissingDeduplicationKey),
            DedupKeyPolicy::Synthesize => {
                let key = format!("auto:{}", Uuid::now_v7());
                warn!(
                    movement = movement.name(),
                    deduplication_key = %key,
                    "no deduplication key supplied, synthesized one; retries of this call are not idempotent"
                );
                movement.meta_mut().deduplication_key = key;
                Ok(true)
            }
        }
    }

    async fn check_ownership(&self, movement: &Movement) -> Result<(), LedgerError> {
        let organization_id = movement.organization_id();

        if let Some(variant_id) = movement.variant_id() {
            let owner = self.directory.variant_owner(variant_id).await?;
            ReferenceKind::Variant.ensure_owned(variant_id, owner, organization_id)?;
        }
        for location_id in movement.location_ids() {
            let status = self.directory.location_status(location_id).await?;
            ReferenceKind::Location.ensure_owned(
                location_id,
                status.map(|s| s.organization_id),
                organization_id,
            )?;
            if status.is_some_and(|s| !s.is_active) {
                return Err(InventoryError::InactiveLocation { location_id }.into());
            }
        }
        if let Some(reservation_id) = movement.reservation_id() {
            let owner = self
                .store
                .reservation(reservation_id)
                .await?
                .map(|r| r.organization_id);
            ReferenceKind::Reservation.ensure_owned(reservation_id, owner, organization_id)?;
        }
        Ok(())
    }

    async fn duplicate_outcome(
        &self,
        prior: PriorMovement,
        deduplication_key: String,
        key_synthesized: bool,
        now: DateTime<Utc>,
    ) -> Result<MovementOutcome, LedgerError> {
        let balances = self.store.balances(&prior.balance_keys(), now).await?;

        // A release or ship links its reservation through the entry.
        let reservation = match prior.reservation {
            Some(r) => Some(r),
            None => match prior.entries.iter().find_map(|e| e.reservation_id) {
                Some(id) => self.store.reservation(id).await?,
                None => None,
            },
        };

        Ok(MovementOutcome {
            kind: OutcomeKind::Duplicate,
            deduplication_key,
            key_synthesized,
            balances,
            entries: prior.entries,
            reservation,
        })
    }
}

//! Postgres-backed ledger store.
//!
//! Every movement runs in one transaction:
//!
//! 1. claim the deduplication key in `inventory_movement_keys`; a concurrent
//!    twin blocks here until the first commits, then fails with `23505`,
//! 2. read the reservation (release needs its location and variant),
//! 3. create-if-missing and `SELECT … FOR UPDATE` each balance row, sorted by
//!    `BalanceKey`,
//! 4. `SELECT … FOR UPDATE` the reservation,
//! 5. run `decide` and write balances, reservation, ledger entries and one
//!    outbox row,
//! 6. commit.
//!
//! Locks are always taken in the same order: key, balances, reservation.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Conflict` |
//! | Database (other) | any other | `Database` |
//! | PoolClosed / PoolTimedOut / Io / Tls | N/A | `Unavailable` |
//! | ColumnDecode / Decode / ColumnNotFound | N/A | `Serialization` |
//! | Other | N/A | `Database` |
//!
//! A `Conflict` while applying a movement triggers one more deduplication
//! lookup; if a twin committed first the movement is reported as a duplicate.
//! Losing the key claim to a twin is the usual way to get there.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgConnection, PgPool, Row};
use tracing::{Span, instrument, warn};
use uuid::Uuid;

use stockledger_core::{
    LedgerEntryId, LocationId, OrganizationId, OutboxEventId, ReservationId, VariantId,
};
use stockledger_events::{OutboxEvent, OutboxStatus};
use stockledger_inventory::{
    Balance, BalanceKey, Decision, LedgerEntry, Location, LockedState, Movement, MovementType,
    Reservation, ReservationStatus, ReservationWrite, SourceRef, VariantRef, decide, lock_order,
};

use super::outbox_row;
use super::r#trait::{
    Applied, BalanceFilter, BalanceListing, LedgerQueries, LedgerStore, LocationStatus,
    OwnershipDirectory, PriorMovement,
};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, StoreError};

macro_rules! balance_select {
    ($tail:literal) => {
        concat!(
            "SELECT organization_id, location_id, variant_id, on_hand, reserved, \
             last_movement_at, updated_at FROM inventory_balances ",
            $tail
        )
    };
}

macro_rules! entry_select {
    ($tail:literal) => {
        concat!(
            "SELECT id, organization_id, location_id, variant_id, delta_on_hand, delta_reserved, \
             movement_type, reason, source_type, source_id, source_line, deduplication_key, \
             reservation_id, occurred_at, created_at, metadata FROM inventory_ledger_entries ",
            $tail
        )
    };
}

macro_rules! reservation_select {
    ($tail:literal) => {
        concat!(
            "SELECT id, organization_id, location_id, variant_id, quantity, status, reserved_at, \
             expires_at, source_type, source_id, source_line, deduplication_key, metadata, \
             created_entry_id, closed_entry_id, closed_at FROM inventory_reservations ",
            $tail
        )
    };
}

/// Postgres-backed ledger store, ownership directory and query surface.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool sized by `config`.
    #[instrument(skip(config), fields(max_connections = config.max_connections), err)]
    pub async fn connect(config: &LedgerConfig) -> Result<Self, StoreError> {
        let url = config
            .require_database_url()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))
    }

    /// Insert or update a location. A new default demotes the previous one.
    #[instrument(skip(self, location), fields(location_id = %location.id, code = %location.code), err)]
    pub async fn upsert_location(&self, location: &Location) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if location.is_default {
            sqlx::query(
                r#"
                UPDATE locations SET is_default = FALSE
                WHERE organization_id = $1 AND id <> $2 AND is_default
                "#,
            )
            .bind(location.organization_id.as_uuid())
            .bind(location.id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("demote_default_location", e))?;
        }

        sqlx::query(
            r#"
            INSERT INTO locations (id, organization_id, code, name, is_virtual, is_default, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                code = EXCLUDED.code,
                name = EXCLUDED.name,
                is_virtual = EXCLUDED.is_virtual,
                is_default = EXCLUDED.is_default,
                is_active = EXCLUDED.is_active
            "#,
        )
        .bind(location.id.as_uuid())
        .bind(location.organization_id.as_uuid())
        .bind(&location.code)
        .bind(&location.name)
        .bind(location.is_virtual)
        .bind(location.is_default)
        .bind(location.is_active)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_location", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self, variant), fields(variant_id = %variant.id, sku = %variant.sku), err)]
    pub async fn upsert_variant(&self, variant: &VariantRef) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO product_variants (id, organization_id, sku, name)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET sku = EXCLUDED.sku, name = EXCLUDED.name
            "#,
        )
        .bind(variant.id.as_uuid())
        .bind(variant.organization_id.as_uuid())
        .bind(&variant.sku)
        .bind(&variant.name)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_variant", e))?;
        Ok(())
    }

    /// Oldest pending outbox rows, for a dispatcher or an operator to inspect.
    #[instrument(skip(self), err)]
    pub async fn pending_outbox(&self, limit: u32) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT id, organization_id, aggregate_type, aggregate_id, event_type, event_version,
                   payload, status, occurred_at, created_at, published_at, error, trace_id
            FROM outbox_events
            WHERE status = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(OutboxStatus::Pending.as_code())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_outbox", e))?;

        rows.into_iter().map(OutboxEvent::try_from).collect()
    }

    async fn apply_in_transaction(
        &self,
        movement: &Movement,
        now: DateTime<Utc>,
    ) -> Result<Applied, LedgerError> {
        let organization_id = movement.organization_id();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        claim_deduplication_key(&mut tx, movement, now).await?;

        // Location and variant of a reservation never change, so an unlocked read
        // is enough to know which balance a release touches.
        let placement = match movement.reservation_id() {
            Some(id) => fetch_reservation(&mut tx, organization_id, id, false).await?,
            None => None,
        };
        let keys = movement.balance_keys(placement.as_ref())?;

        let mut locked: HashMap<BalanceKey, Balance> = HashMap::with_capacity(keys.len());
        for key in lock_order(&keys) {
            let balance = lock_balance(&mut tx, key, now).await?;
            locked.insert(key, balance);
        }

        let reservation = match movement.reservation_id() {
            Some(id) => fetch_reservation(&mut tx, organization_id, id, true).await?,
            None => None,
        };

        let balances = keys
            .iter()
            .map(|k| {
                locked
                    .get(k)
                    .cloned()
                    .ok_or_else(|| StoreError::Database(format!("balance {k} was not locked")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Any error from here on drops `tx`, which rolls it back and frees the key.
        let writes = match decide(
            movement,
            LockedState {
                balances,
                reservation,
            },
            now,
        )? {
            Decision::Unchanged(balance) => {
                // Nothing was written, so the key stays unused.
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Ok(Applied::Unchanged { balance });
            }
            Decision::Apply(writes) => writes,
        };

        let outbox = outbox_row(movement, &writes.event, now)?;

        for balance in &writes.balances {
            update_balance(&mut tx, balance).await?;
        }
        // The reservation goes first: entries reference it.
        match &writes.reservation {
            Some(ReservationWrite::Insert(r)) => insert_reservation(&mut tx, r).await?,
            Some(ReservationWrite::Update(r)) => update_reservation(&mut tx, r).await?,
            None => {}
        }
        for entry in &writes.entries {
            insert_entry(&mut tx, entry).await?;
        }
        insert_outbox(&mut tx, &outbox).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("entries", writes.entries.len());
        Ok(Applied::Written {
            balances: writes.balances,
            entries: writes.entries,
            reservation: writes.reservation.map(ReservationWrite::into_reservation),
            outbox,
        })
    }
}

#[async_trait::async_trait]
impl OwnershipDirectory for PostgresLedgerStore {
    async fn variant_owner(
        &self,
        variant_id: VariantId,
    ) -> Result<Option<OrganizationId>, StoreError> {
        let owner: Option<Uuid> =
            sqlx::query_scalar("SELECT organization_id FROM product_variants WHERE id = $1")
                .bind(variant_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("variant_owner", e))?;
        Ok(owner.map(OrganizationId::from_uuid))
    }

    async fn location_status(
        &self,
        location_id: LocationId,
    ) -> Result<Option<LocationStatus>, StoreError> {
        let row: Option<(Uuid, bool)> =
            sqlx::query_as("SELECT organization_id, is_active FROM locations WHERE id = $1")
                .bind(location_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("location_status", e))?;
        Ok(row.map(|(organization_id, is_active)| LocationStatus {
            organization_id: OrganizationId::from_uuid(organization_id),
            is_active,
        }))
    }
}

#[async_trait::async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn find_duplicate(
        &self,
        organization_id: OrganizationId,
        deduplication_key: &str,
    ) -> Result<Option<PriorMovement>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        find_duplicate_on(&mut conn, organization_id, deduplication_key).await
    }

    async fn reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<Reservation>, StoreError> {
        let row = sqlx::query_as::<_, ReservationRow>(reservation_select!("WHERE id = $1"))
            .bind(reservation_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("reservation", e))?;
        row.map(Reservation::try_from).transpose()
    }

    async fn balances(
        &self,
        keys: &[BalanceKey],
        now: DateTime<Utc>,
    ) -> Result<Vec<Balance>, StoreError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let row = sqlx::query_as::<_, BalanceRow>(balance_select!(
                "WHERE organization_id = $1 AND location_id = $2 AND variant_id = $3"
            ))
            .bind(key.organization_id.as_uuid())
            .bind(key.location_id.as_uuid())
            .bind(key.variant_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("balances", e))?;
            out.push(row.map(Balance::from).unwrap_or_else(|| Balance::empty(*key, now)));
        }
        Ok(out)
    }

    #[instrument(
        skip(self, movement, now),
        fields(
            organization_id = %movement.organization_id(),
            movement = movement.name(),
            deduplication_key = %movement.deduplication_key(),
            entries = tracing::field::Empty
        ),
        err
    )]
    async fn apply(&self, movement: &Movement, now: DateTime<Utc>) -> Result<Applied, LedgerError> {
        match self.apply_in_transaction(movement, now).await {
            Err(LedgerError::Store(StoreError::Conflict(msg))) => {
                warn!(conflict = %msg, "conflict while applying movement, re-checking deduplication key");
                match self
                    .find_duplicate(movement.organization_id(), movement.deduplication_key())
                    .await?
                {
                    Some(prior) => Ok(Applied::Duplicate(prior)),
                    None => Err(StoreError::Conflict(msg).into()),
                }
            }
            other => other,
        }
    }
}

#[async_trait::async_trait]
impl LedgerQueries for PostgresLedgerStore {
    async fn list_balances(
        &self,
        organization_id: OrganizationId,
        filter: &BalanceFilter,
    ) -> Result<Vec<BalanceListing>, StoreError> {
        let location_param: Option<Uuid> = filter.location_id.map(|id| *id.as_uuid());
        let search_param: Option<String> = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(like_pattern);

        let rows = sqlx::query_as::<_, BalanceListingRow>(
            r#"
            SELECT b.organization_id, b.location_id, b.variant_id, b.on_hand, b.reserved,
                   b.last_movement_at, b.updated_at,
                   l.code AS location_code, v.sku, v.name AS variant_name
            FROM inventory_balances b
            JOIN locations l ON l.id = b.location_id
            JOIN product_variants v ON v.id = b.variant_id
            WHERE b.organization_id = $1
                AND ($2::uuid IS NULL OR b.location_id = $2)
                AND ($3::text IS NULL OR v.sku ILIKE $3 OR v.name ILIKE $3)
            ORDER BY l.code ASC, v.sku ASC
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(location_param)
        .bind(search_param)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_balances", e))?;

        Ok(rows.into_iter().map(BalanceListing::from).collect())
    }

    async fn recent_entries(
        &self,
        organization_id: OrganizationId,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query_as::<_, EntryRow>(entry_select!(
            "WHERE organization_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2"
        ))
        .bind(organization_id.as_uuid())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_entries", e))?;

        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn active_reservations(
        &self,
        organization_id: OrganizationId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StoreError> {
        let rows = sqlx::query_as::<_, ReservationRow>(reservation_select!(
            "WHERE organization_id = $1 AND status = $2 \
             AND (expires_at IS NULL OR expires_at > $3) \
             ORDER BY reserved_at ASC, id ASC"
        ))
        .bind(organization_id.as_uuid())
        .bind(ReservationStatus::Active.as_code())
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_reservations", e))?;

        rows.into_iter().map(Reservation::try_from).collect()
    }
}

async fn find_duplicate_on(
    conn: &mut PgConnection,
    organization_id: OrganizationId,
    deduplication_key: &str,
) -> Result<Option<PriorMovement>, StoreError> {
    // Transfer legs share `created_at`; the out leg's code (3) sorts first.
    let entries = sqlx::query_as::<_, EntryRow>(entry_select!(
        "WHERE organization_id = $1 AND deduplication_key = $2 \
         ORDER BY created_at ASC, movement_type ASC"
    ))
    .bind(organization_id.as_uuid())
    .bind(deduplication_key)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("find_duplicate_entries", e))?
    .into_iter()
    .map(LedgerEntry::try_from)
    .collect::<Result<Vec<_>, _>>()?;

    let reservation = sqlx::query_as::<_, ReservationRow>(reservation_select!(
        "WHERE organization_id = $1 AND deduplication_key = $2"
    ))
    .bind(organization_id.as_uuid())
    .bind(deduplication_key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("find_duplicate_reservation", e))?
    .map(Reservation::try_from)
    .transpose()?;

    if entries.is_empty() && reservation.is_none() {
        Ok(None)
    } else {
        Ok(Some(PriorMovement {
            entries,
            reservation,
        }))
    }
}

async fn fetch_reservation(
    conn: &mut PgConnection,
    organization_id: OrganizationId,
    reservation_id: ReservationId,
    for_update: bool,
) -> Result<Option<Reservation>, StoreError> {
    let sql = if for_update {
        reservation_select!("WHERE id = $1 AND organization_id = $2 FOR UPDATE")
    } else {
        reservation_select!("WHERE id = $1 AND organization_id = $2")
    };
    sqlx::query_as::<_, ReservationRow>(sql)
        .bind(reservation_id.as_uuid())
        .bind(organization_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("fetch_reservation", e))?
        .map(Reservation::try_from)
        .transpose()
}

/// Create the row if it does not exist yet, then lock it.
async fn lock_balance(
    conn: &mut PgConnection,
    key: BalanceKey,
    now: DateTime<Utc>,
) -> Result<Balance, StoreError> {
    sqlx::query(
        r#"
        INSERT INTO inventory_balances (organization_id, location_id, variant_id, on_hand, reserved, updated_at)
        VALUES ($1, $2, $3, 0, 0, $4)
        ON CONFLICT (organization_id, location_id, variant_id) DO NOTHING
        "#,
    )
    .bind(key.organization_id.as_uuid())
    .bind(key.location_id.as_uuid())
    .bind(key.variant_id.as_uuid())
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("create_balance", e))?;

    let row = sqlx::query_as::<_, BalanceRow>(balance_select!(
        "WHERE organization_id = $1 AND location_id = $2 AND variant_id = $3 FOR UPDATE"
    ))
    .bind(key.organization_id.as_uuid())
    .bind(key.location_id.as_uuid())
    .bind(key.variant_id.as_uuid())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("lock_balance", e))?;

    Ok(row.into())
}

async fn update_balance(conn: &mut PgConnection, balance: &Balance) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE inventory_balances
        SET on_hand = $4, reserved = $5, last_movement_at = $6, updated_at = $7
        WHERE organization_id = $1 AND location_id = $2 AND variant_id = $3
        "#,
    )
    .bind(balance.organization_id.as_uuid())
    .bind(balance.location_id.as_uuid())
    .bind(balance.variant_id.as_uuid())
    .bind(balance.on_hand)
    .bind(balance.reserved)
    .bind(balance.last_movement_at)
    .bind(balance.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("update_balance", e))?;
    Ok(())
}

async fn insert_entry(conn: &mut PgConnection, entry: &LedgerEntry) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO inventory_ledger_entries (
            id, organization_id, location_id, variant_id, delta_on_hand, delta_reserved,
            movement_type, reason, source_type, source_id, source_line, deduplication_key,
            reservation_id, occurred_at, created_at, metadata
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(entry.id.as_uuid())
    .bind(entry.organization_id.as_uuid())
    .bind(entry.location_id.as_uuid())
    .bind(entry.variant_id.as_uuid())
    .bind(entry.delta_on_hand)
    .bind(entry.delta_reserved)
    .bind(entry.movement_type.as_code())
    .bind(&entry.reason)
    .bind(&entry.source.source_type)
    .bind(&entry.source.source_id)
    .bind(&entry.source.source_line)
    .bind(&entry.deduplication_key)
    .bind(entry.reservation_id.map(|id| *id.as_uuid()))
    .bind(entry.occurred_at)
    .bind(entry.created_at)
    .bind(JsonValue::Object(entry.metadata.clone()))
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_entry", e))?;
    Ok(())
}

async fn insert_reservation(
    conn: &mut PgConnection,
    reservation: &Reservation,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO inventory_reservations (
            id, organization_id, location_id, variant_id, quantity, status, reserved_at,
            expires_at, source_type, source_id, source_line, deduplication_key, metadata,
            created_entry_id, closed_entry_id, closed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(reservation.id.as_uuid())
    .bind(reservation.organization_id.as_uuid())
    .bind(reservation.location_id.as_uuid())
    .bind(reservation.variant_id.as_uuid())
    .bind(reservation.quantity)
    .bind(reservation.status.as_code())
    .bind(reservation.reserved_at)
    .bind(reservation.expires_at)
    .bind(&reservation.source.source_type)
    .bind(&reservation.source.source_id)
    .bind(&reservation.source.source_line)
    .bind(&reservation.deduplication_key)
    .bind(JsonValue::Object(reservation.metadata.clone()))
    .bind(reservation.created_entry_id.map(|id| *id.as_uuid()))
    .bind(reservation.closed_entry_id.map(|id| *id.as_uuid()))
    .bind(reservation.closed_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_reservation", e))?;
    Ok(())
}

async fn update_reservation(
    conn: &mut PgConnection,
    reservation: &Reservation,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE inventory_reservations
        SET status = $3, closed_entry_id = $4, closed_at = $5
        WHERE id = $1 AND organization_id = $2
        "#,
    )
    .bind(reservation.id.as_uuid())
    .bind(reservation.organization_id.as_uuid())
    .bind(reservation.status.as_code())
    .bind(reservation.closed_entry_id.map(|id| *id.as_uuid()))
    .bind(reservation.closed_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("update_reservation", e))?;
    Ok(())
}

async fn insert_outbox(conn: &mut PgConnection, event: &OutboxEvent) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO outbox_events (
            id, organization_id, aggregate_type, aggregate_id, event_type, event_version,
            payload, status, occurred_at, created_at, published_at, error, trace_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(event.id.as_uuid())
    .bind(event.organization_id.map(|id| *id.as_uuid()))
    .bind(&event.aggregate_type)
    .bind(&event.aggregate_id)
    .bind(&event.event_type)
    .bind(event_version_column(event.event_version)?)
    .bind(&event.payload)
    .bind(event.status.as_code())
    .bind(event.occurred_at)
    .bind(event.created_at)
    .bind(event.published_at)
    .bind(&event.error)
    .bind(&event.trace_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_outbox", e))?;
    Ok(())
}

/// Fails with a unique violation (`Conflict`) when another movement already
/// used the key or is about to commit with it.
async fn claim_deduplication_key(
    conn: &mut PgConnection,
    movement: &Movement,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO inventory_movement_keys (organization_id, deduplication_key, movement_type, created_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(movement.organization_id().as_uuid())
    .bind(movement.deduplication_key())
    .bind(movement.name())
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("claim_deduplication_key", e))?;
    Ok(())
}

fn event_version_column(version: u32) -> Result<i32, StoreError> {
    i32::try_from(version).map_err(|_| {
        StoreError::Serialization(format!("event_version {version} does not fit an INTEGER column"))
    })
}

/// `%term%` for ILIKE, with LIKE metacharacters escaped.
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn json_object(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StoreError::Unavailable(format!("{operation}: {err}")),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Serialization(format!("{operation}: {err}"))
        }
        _ => StoreError::Database(format!("sqlx error in {operation}: {err}")),
    }
}

struct BalanceRow {
    organization_id: Uuid,
    location_id: Uuid,
    variant_id: Uuid,
    on_hand: Decimal,
    reserved: Decimal,
    last_movement_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for BalanceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(BalanceRow {
            organization_id: row.try_get("organization_id")?,
            location_id: row.try_get("location_id")?,
            variant_id: row.try_get("variant_id")?,
            on_hand: row.try_get("on_hand")?,
            reserved: row.try_get("reserved")?,
            last_movement_at: row.try_get("last_movement_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<BalanceRow> for Balance {
    fn from(row: BalanceRow) -> Self {
        Balance {
            organization_id: OrganizationId::from_uuid(row.organization_id),
            location_id: LocationId::from_uuid(row.location_id),
            variant_id: VariantId::from_uuid(row.variant_id),
            on_hand: row.on_hand.normalize(),
            reserved: row.reserved.normalize(),
            last_movement_at: row.last_movement_at,
            updated_at: row.updated_at,
        }
    }
}

struct BalanceListingRow {
    balance: BalanceRow,
    location_code: String,
    sku: String,
    variant_name: String,
}

impl<'r> FromRow<'r, PgRow> for BalanceListingRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(BalanceListingRow {
            balance: BalanceRow::from_row(row)?,
            location_code: row.try_get("location_code")?,
            sku: row.try_get("sku")?,
            variant_name: row.try_get("variant_name")?,
        })
    }
}

impl From<BalanceListingRow> for BalanceListing {
    fn from(row: BalanceListingRow) -> Self {
        BalanceListing {
            balance: row.balance.into(),
            location_code: row.location_code,
            sku: row.sku,
            variant_name: row.variant_name,
        }
    }
}

struct EntryRow {
    id: Uuid,
    organization_id: Uuid,
    location_id: Uuid,
    variant_id: Uuid,
    delta_on_hand: Decimal,
    delta_reserved: Decimal,
    movement_type: i16,
    reason: Option<String>,
    source: SourceRef,
    deduplication_key: String,
    reservation_id: Option<Uuid>,
    occurred_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    metadata: JsonValue,
}

impl<'r> FromRow<'r, PgRow> for EntryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EntryRow {
            id: row.try_get("id")?,
            organization_id: row.try_get("organization_id")?,
            location_id: row.try_get("location_id")?,
            variant_id: row.try_get("variant_id")?,
            delta_on_hand: row.try_get("delta_on_hand")?,
            delta_reserved: row.try_get("delta_reserved")?,
            movement_type: row.try_get("movement_type")?,
            reason: row.try_get("reason")?,
            source: source_from_row(row)?,
            deduplication_key: row.try_get("deduplication_key")?,
            reservation_id: row.try_get("reservation_id")?,
            occurred_at: row.try_get("occurred_at")?,
            created_at: row.try_get("created_at")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

impl TryFrom<EntryRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let movement_type = MovementType::from_code(row.movement_type).ok_or_else(|| {
            StoreError::Serialization(format!("unknown movement_type code {}", row.movement_type))
        })?;
        Ok(LedgerEntry {
            id: LedgerEntryId::from_uuid(row.id),
            organization_id: OrganizationId::from_uuid(row.organization_id),
            location_id: LocationId::from_uuid(row.location_id),
            variant_id: VariantId::from_uuid(row.variant_id),
            delta_on_hand: row.delta_on_hand.normalize(),
            delta_reserved: row.delta_reserved.normalize(),
            movement_type,
            reason: row.reason,
            source: row.source,
            deduplication_key: row.deduplication_key,
            reservation_id: row.reservation_id.map(ReservationId::from_uuid),
            occurred_at: row.occurred_at,
            created_at: row.created_at,
            metadata: json_object(row.metadata),
        })
    }
}

struct ReservationRow {
    id: Uuid,
    organization_id: Uuid,
    location_id: Uuid,
    variant_id: Uuid,
    quantity: Decimal,
    status: i16,
    reserved_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    source: SourceRef,
    deduplication_key: String,
    metadata: JsonValue,
    created_entry_id: Option<Uuid>,
    closed_entry_id: Option<Uuid>,
    closed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for ReservationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ReservationRow {
            id: row.try_get("id")?,
            organization_id: row.try_get("organization_id")?,
            location_id: row.try_get("location_id")?,
            variant_id: row.try_get("variant_id")?,
            quantity: row.try_get("quantity")?,
            status: row.try_get("status")?,
            reserved_at: row.try_get("reserved_at")?,
            expires_at: row.try_get("expires_at")?,
            source: source_from_row(row)?,
            deduplication_key: row.try_get("deduplication_key")?,
            metadata: row.try_get("metadata")?,
            created_entry_id: row.try_get("created_entry_id")?,
            closed_entry_id: row.try_get("closed_entry_id")?,
            closed_at: row.try_get("closed_at")?,
        })
    }
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        let status = ReservationStatus::from_code(row.status).ok_or_else(|| {
            StoreError::Serialization(format!("unknown reservation status code {}", row.status))
        })?;
        Ok(Reservation {
            id: ReservationId::from_uuid(row.id),
            organization_id: OrganizationId::from_uuid(row.organization_id),
            location_id: LocationId::from_uuid(row.location_id),
            variant_id: VariantId::from_uuid(row.variant_id),
            quantity: row.quantity.normalize(),
            status,
            reserved_at: row.reserved_at,
            expires_at: row.expires_at,
            source: row.source,
            deduplication_key: row.deduplication_key,
            metadata: json_object(row.metadata),
            created_entry_id: row.created_entry_id.map(LedgerEntryId::from_uuid),
            closed_entry_id: row.closed_entry_id.map(LedgerEntryId::from_uuid),
            closed_at: row.closed_at,
        })
    }
}

fn source_from_row(row: &PgRow) -> Result<SourceRef, sqlx::Error> {
    Ok(SourceRef {
        source_type: row.try_get("source_type")?,
        source_id: row.try_get("source_id")?,
        source_line: row.try_get("source_line")?,
    })
}

struct OutboxRow {
    id: Uuid,
    organization_id: Option<Uuid>,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    event_version: i32,
    payload: JsonValue,
    status: i16,
    occurred_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    error: Option<String>,
    trace_id: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            organization_id: row.try_get("organization_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            occurred_at: row.try_get("occurred_at")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
            error: row.try_get("error")?,
            trace_id: row.try_get("trace_id")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status = OutboxStatus::from_code(row.status).ok_or_else(|| {
            StoreError::Serialization(format!("unknown outbox status code {}", row.status))
        })?;
        let event_version = u32::try_from(row.event_version).map_err(|_| {
            StoreError::Serialization(format!("negative event_version {}", row.event_version))
        })?;
        Ok(OutboxEvent {
            id: OutboxEventId::from_uuid(row.id),
            organization_id: row.organization_id.map(OrganizationId::from_uuid),
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            event_version,
            payload: row.payload,
            status,
            occurred_at: row.occurred_at,
            created_at: row.created_at,
            published_at: row.published_at,
            error: row.error,
            trace_id: row.trace_id,
        })
    }
}

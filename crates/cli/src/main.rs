mod cli;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Serialize;

use stockledger_core::{LocationId, OrganizationId, VariantId};
use stockledger_infra::{BalanceFilter, LedgerConfig, LedgerEngine, PostgresLedgerStore};
use stockledger_inventory::{
    Adjust, Location, Receive, Release, Reserve, Ship, Transfer, VariantRef,
};

use crate::cli::{Cli, Command};

type Engine = LedgerEngine<Arc<PostgresLedgerStore>, Arc<PostgresLedgerStore>>;

#[tokio::main]
async fn main() -> Result<()> {
    stockledger_observability::init();
    let args = Cli::parse();

    let org = match (args.org, args.command.is_tenant_scoped()) {
        (Some(org), _) => Some(org),
        (None, false) => None,
        (None, true) => bail!("--org (or STOCKLEDGER_ORG) is required for this command"),
    };

    let config = LedgerConfig::from_env().context("invalid configuration")?;
    let store = Arc::new(
        PostgresLedgerStore::connect(&config)
            .await
            .context("failed to connect to the database")?,
    );
    let engine = LedgerEngine::from_config(store.clone(), store.clone(), &config);

    run(args.command, org, &engine, &store).await
}

async fn run(
    command: Command,
    org: Option<OrganizationId>,
    engine: &Engine,
    store: &PostgresLedgerStore,
) -> Result<()> {
    // Tenant-scoped commands were checked in main.
    let tenant = || org.context("--org is required");

    match command {
        Command::Migrate => {
            store.migrate().await?;
            tracing::info!("migrations applied");
        }
        Command::AddLocation {
            code,
            name,
            id,
            is_default,
            is_virtual,
            inactive,
        } => {
            let mut location = Location::new(tenant()?, code, name);
            location.id = id.unwrap_or_else(LocationId::new);
            location.is_default = is_default;
            location.is_virtual = is_virtual;
            location.is_active = !inactive;
            store.upsert_location(&location).await?;
            print(&location)?;
        }
        Command::AddVariant { sku, name, id } => {
            let mut variant = VariantRef::new(tenant()?, sku, name);
            variant.id = id.unwrap_or_else(VariantId::new);
            store.upsert_variant(&variant).await?;
            print(&variant)?;
        }
        Command::Receive {
            location,
            variant,
            quantity,
            meta,
        } => {
            let outcome = engine
                .receive(Receive {
                    organization_id: tenant()?,
                    location_id: location,
                    variant_id: variant,
                    quantity,
                    meta: meta.into(),
                })
                .await?;
            print(&outcome)?;
        }
        Command::Adjust {
            location,
            variant,
            new_on_hand,
            meta,
        } => {
            let outcome = engine
                .adjust(Adjust {
                    organization_id: tenant()?,
                    location_id: location,
                    variant_id: variant,
                    new_on_hand,
                    meta: meta.into(),
                })
                .await?;
            print(&outcome)?;
        }
        Command::Transfer {
            variant,
            from,
            to,
            quantity,
            meta,
        } => {
            let outcome = engine
                .transfer(Transfer {
                    organization_id: tenant()?,
                    variant_id: variant,
                    from_location_id: from,
                    to_location_id: to,
                    quantity,
                    meta: meta.into(),
                })
                .await?;
            print(&outcome)?;
        }
        Command::Reserve {
            location,
            variant,
            quantity,
            expires_at,
            meta,
        } => {
            let outcome = engine
                .reserve(Reserve {
                    organization_id: tenant()?,
                    location_id: location,
                    variant_id: variant,
                    quantity,
                    expires_at,
                    meta: meta.into(),
                })
                .await?;
            print(&outcome)?;
        }
        Command::Release { reservation, meta } => {
            let outcome = engine
                .release(Release {
                    organization_id: tenant()?,
                    reservation_id: reservation,
                    meta: meta.into(),
                })
                .await?;
            print(&outcome)?;
        }
        Command::Ship {
            location,
            variant,
            quantity,
            reservation,
            meta,
        } => {
            let outcome = engine
                .ship(Ship {
                    organization_id: tenant()?,
                    location_id: location,
                    variant_id: variant,
                    quantity,
                    reservation_id: reservation,
                    meta: meta.into(),
                })
                .await?;
            print(&outcome)?;
        }
        Command::Balances { location, search } => {
            let filter = BalanceFilter {
                location_id: location,
                search,
            };
            print(&engine.list_balances(tenant()?, &filter).await?)?;
        }
        Command::Ledger { limit } => {
            print(&engine.recent_entries(tenant()?, limit).await?)?;
        }
        Command::Reservations => {
            print(&engine.active_reservations(tenant()?).await?)?;
        }
        Command::Outbox { limit } => {
            print(&store.pending_outbox(limit).await?)?;
        }
    }
    Ok(())
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

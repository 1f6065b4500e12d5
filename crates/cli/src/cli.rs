//! Command-line surface.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use serde_json::{Map, Value as JsonValue};

use stockledger_core::{LocationId, OrganizationId, ReservationId, VariantId};
use stockledger_inventory::{MovementMeta, SourceRef};

#[derive(Debug, Parser)]
#[command(name = "stockledger", version, about = "Multi-tenant inventory ledger")]
pub struct Cli {
    /// Organization every command acts on behalf of.
    #[arg(long, env = "STOCKLEDGER_ORG", global = true)]
    pub org: Option<OrganizationId>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply pending schema migrations.
    Migrate,

    /// Register (or update) a stock location.
    AddLocation {
        #[arg(long)]
        code: String,
        #[arg(long)]
        name: String,
        /// Reuse an existing id to update it.
        #[arg(long)]
        id: Option<LocationId>,
        #[arg(long = "default")]
        is_default: bool,
        #[arg(long = "virtual")]
        is_virtual: bool,
        /// Stop accepting movements at this location.
        #[arg(long)]
        inactive: bool,
    },

    /// Register (or update) a product variant the ledger may track.
    AddVariant {
        #[arg(long)]
        sku: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        id: Option<VariantId>,
    },

    /// Add stock at a location.
    Receive {
        #[arg(long)]
        location: LocationId,
        #[arg(long)]
        variant: VariantId,
        #[arg(long)]
        quantity: Decimal,
        #[command(flatten)]
        meta: MetaArgs,
    },

    /// Set on-hand to a counted value.
    Adjust {
        #[arg(long)]
        location: LocationId,
        #[arg(long)]
        variant: VariantId,
        #[arg(long)]
        new_on_hand: Decimal,
        #[command(flatten)]
        meta: MetaArgs,
    },

    /// Move available stock between two locations.
    Transfer {
        #[arg(long)]
        variant: VariantId,
        #[arg(long)]
        from: LocationId,
        #[arg(long)]
        to: LocationId,
        #[arg(long)]
        quantity: Decimal,
        #[command(flatten)]
        meta: MetaArgs,
    },

    /// Hold available stock for later shipment.
    Reserve {
        #[arg(long)]
        location: LocationId,
        #[arg(long)]
        variant: VariantId,
        #[arg(long)]
        quantity: Decimal,
        /// RFC 3339 timestamp after which the hold is considered stale.
        #[arg(long)]
        expires_at: Option<DateTime<Utc>>,
        #[command(flatten)]
        meta: MetaArgs,
    },

    /// Cancel an active reservation.
    Release {
        #[arg(long)]
        reservation: ReservationId,
        #[command(flatten)]
        meta: MetaArgs,
    },

    /// Remove stock that left the building.
    Ship {
        #[arg(long)]
        location: LocationId,
        #[arg(long)]
        variant: VariantId,
        #[arg(long)]
        quantity: Decimal,
        /// Consume this reservation instead of drawing on available stock.
        #[arg(long)]
        reservation: Option<ReservationId>,
        #[command(flatten)]
        meta: MetaArgs,
    },

    /// List balances with location and variant labels.
    Balances {
        #[arg(long)]
        location: Option<LocationId>,
        /// Case-insensitive match on sku or variant name.
        #[arg(long)]
        search: Option<String>,
    },

    /// Show the most recent ledger entries.
    Ledger {
        #[arg(long)]
        limit: Option<u32>,
    },

    /// List active, unexpired reservations.
    Reservations,

    /// Show outbox events waiting for the dispatcher.
    Outbox {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

impl Command {
    /// Whether the command needs `--org`.
    pub fn is_tenant_scoped(&self) -> bool {
        !matches!(self, Command::Migrate | Command::Outbox { .. })
    }
}

/// Options shared by every movement.
#[derive(Debug, Clone, Args)]
pub struct MetaArgs {
    /// Idempotency key; repeat it when retrying the same operation.
    #[arg(long = "key", default_value = "")]
    pub deduplication_key: String,
    #[arg(long)]
    pub reason: Option<String>,
    #[arg(long)]
    pub source_type: Option<String>,
    #[arg(long)]
    pub source_id: Option<String>,
    #[arg(long)]
    pub source_line: Option<String>,
    /// Business time of the movement (RFC 3339).
    #[arg(long)]
    pub occurred_at: Option<DateTime<Utc>>,
    /// Extra attributes as a JSON object.
    #[arg(long, value_parser = parse_json_object)]
    pub metadata: Option<Map<String, JsonValue>>,
    #[arg(long, env = "STOCKLEDGER_TRACE_ID")]
    pub trace_id: Option<String>,
}

impl From<MetaArgs> for MovementMeta {
    fn from(args: MetaArgs) -> Self {
        MovementMeta {
            deduplication_key: args.deduplication_key,
            reason: args.reason,
            source: SourceRef {
                source_type: args.source_type,
                source_id: args.source_id,
                source_line: args.source_line,
            },
            occurred_at: args.occurred_at,
            metadata: args.metadata.unwrap_or_default(),
            trace_id: args.trace_id,
        }
    }
}

fn parse_json_object(raw: &str) -> Result<Map<String, JsonValue>, String> {
    match serde_json::from_str::<JsonValue>(raw) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(_) => Err("expected a JSON object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn receive_parses_meta_flags() {
        let org = OrganizationId::new();
        let location = LocationId::new();
        let variant = VariantId::new();
        let cli = Cli::try_parse_from([
            "stockledger",
            "--org",
            &org.to_string(),
            "receive",
            "--location",
            &location.to_string(),
            "--variant",
            &variant.to_string(),
            "--quantity",
            "12.5",
            "--key",
            "po-17-line-1",
            "--source-type",
            "purchase_order",
            "--source-id",
            "PO-17",
            "--metadata",
            r#"{"carrier":"dhl"}"#,
        ])
        .unwrap();

        assert_eq!(cli.org, Some(org));
        let Command::Receive { quantity, meta, .. } = cli.command else {
            panic!("expected receive");
        };
        assert_eq!(quantity, Decimal::new(125, 1));

        let meta = MovementMeta::from(meta);
        assert_eq!(meta.deduplication_key, "po-17-line-1");
        assert_eq!(meta.source.source_id.as_deref(), Some("PO-17"));
        assert_eq!(meta.metadata["carrier"], "dhl");
    }

    #[test]
    fn metadata_must_be_an_object() {
        assert!(parse_json_object("[1,2]").is_err());
        assert!(parse_json_object("{").is_err());
        assert!(parse_json_object("{}").unwrap().is_empty());
    }

    #[test]
    fn migrate_needs_no_organization() {
        let cli = Cli::try_parse_from(["stockledger", "migrate"]).unwrap();
        assert!(!cli.command.is_tenant_scoped());
    }
}

//! `stockledger-core`: identifiers and the base domain error.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{LedgerEntryId, LocationId, OrganizationId, OutboxEventId, ReservationId, VariantId};

//! Location reference data.
//!
//! The ledger only reads locations; `LocationRegistry` is the in-process
//! registry used by the in-memory store and keeps the one-default rule.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, LocationId, OrganizationId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub organization_id: OrganizationId,
    pub code: String,
    pub name: String,
    pub is_virtual: bool,
    pub is_default: bool,
    pub is_active: bool,
}

impl Location {
    /// An active, physical, non-default location.
    pub fn new(organization_id: OrganizationId, code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: LocationId::new(),
            organization_id,
            code: code.into(),
            name: name.into(),
            is_virtual: false,
            is_default: false,
            is_active: true,
        }
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn as_virtual(mut self) -> Self {
        self.is_virtual = true;
        self
    }
}

#[derive(Debug, Default)]
pub struct LocationRegistry {
    locations: HashMap<LocationId, Location>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a location.
    ///
    /// Registering a default demotes the organization's previous default.
    /// Codes are unique per organization.
    pub fn register(&mut self, location: Location) -> Result<(), DomainError> {
        if location.code.trim().is_empty() {
            return Err(DomainError::validation("location code cannot be empty"));
        }
        let clash = self.locations.values().any(|l| {
            l.organization_id == location.organization_id
                && l.id != location.id
                && l.code.eq_ignore_ascii_case(&location.code)
        });
        if clash {
            return Err(DomainError::validation(format!(
                "location code '{}' already in use",
                location.code
            )));
        }

        if location.is_default {
            for l in self.locations.values_mut() {
                if l.organization_id == location.organization_id && l.id != location.id {
                    l.is_default = false;
                }
            }
        }
        self.locations.insert(location.id, location);
        Ok(())
    }

    pub fn get(&self, id: LocationId) -> Option<&Location> {
        self.locations.get(&id)
    }

    pub fn default_for(&self, organization_id: OrganizationId) -> Option<&Location> {
        self.locations
            .values()
            .find(|l| l.organization_id == organization_id && l.is_default)
    }

    pub fn list(&self, organization_id: OrganizationId) -> Vec<Location> {
        let mut out: Vec<Location> = self
            .locations
            .values()
            .filter(|l| l.organization_id == organization_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.code.cmp(&b.code));
        out
    }
}

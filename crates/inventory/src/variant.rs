use serde::{Deserialize, Serialize};

use stockledger_core::{OrganizationId, VariantId};

/// The slice of a catalog variant the ledger needs: identity, owner, and the
/// labels balance search matches on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRef {
    pub id: VariantId,
    pub organization_id: OrganizationId,
    pub sku: String,
    pub name: String,
}

impl VariantRef {
    pub fn new(organization_id: OrganizationId, sku: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: VariantId::new(),
            organization_id,
            sku: sku.into(),
            name: name.into(),
        }
    }

    /// Case-insensitive substring match on sku or name.
    pub fn matches(&self, term: &str) -> bool {
        let term = term.trim().to_lowercase();
        term.is_empty()
            || self.sku.to_lowercase().contains(&term)
            || self.name.to_lowercase().contains(&term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_matches_sku_or_name_ignoring_case() {
        let v = VariantRef::new(OrganizationId::new(), "TSHIRT-RED-M", "Red T-Shirt (M)");
        assert!(v.matches("red-m"));
        assert!(v.matches("t-shirt"));
        assert!(v.matches("  "));
        assert!(!v.matches("blue"));
    }
}

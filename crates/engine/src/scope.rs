//! Dynamic consistency boundary keys.

use common::TenantId;
use serde::{Deserialize, Serialize};

/// Identifies the consistency boundary an optimistic-concurrency check
/// applies to. A scope may span multiple underlying entities; every
/// command commits against exactly one scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    tenant: TenantId,
    scope_type: String,
    scope_id: String,
}

impl ScopeKey {
    /// Builds a scope key. Pure composition; the same inputs always
    /// produce the same key.
    pub fn new(
        tenant: impl Into<TenantId>,
        scope_type: impl Into<String>,
        scope_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            scope_type: scope_type.into(),
            scope_id: scope_id.into(),
        }
    }

    /// The tenant this scope belongs to.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// The partition key for OCC retries of this scope. All retries for
    /// one scope share the partition, so the dispatcher processes them
    /// strictly FIFO and two retries for the same scope never race each
    /// other into a second conflict.
    pub fn partition_key(&self) -> String {
        format!("dcb:{self}")
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tenant:{}:{}:{}",
            self.tenant, self.scope_type, self.scope_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_composition_is_deterministic() {
        let a = ScopeKey::new("acme", "order", "ORD-1");
        let b = ScopeKey::new("acme", "order", "ORD-1");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "tenant:acme:order:ORD-1");
    }

    #[test]
    fn partition_key_is_prefixed() {
        let key = ScopeKey::new("acme", "reservation", "SKU-9");
        assert_eq!(key.partition_key(), "dcb:tenant:acme:reservation:SKU-9");
    }

    #[test]
    fn distinct_scopes_produce_distinct_partitions() {
        let a = ScopeKey::new("acme", "order", "ORD-1");
        let b = ScopeKey::new("acme", "order", "ORD-2");
        assert_ne!(a.partition_key(), b.partition_key());
    }
}

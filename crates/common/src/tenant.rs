//! Tenant identifier validation.
//!
//! All persistent and vector data is partitioned by tenant. A tenant id is
//! a string of `[A-Za-z0-9_-]`, between 1 and 100 characters.

use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A validated tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Parse and validate a tenant id.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw.len() > 100 {
            return Err(AppError::InvalidTenant {
                tenant: raw.to_string(),
            });
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(AppError::InvalidTenant {
                tenant: raw.to_string(),
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The vector collection name for this tenant.
    pub fn collection_name(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_alphanumeric_underscore_dash() {
        assert!(TenantId::parse("a_b-1").is_ok());
        assert!(TenantId::parse("ACME").is_ok());
        assert!(TenantId::parse("0").is_ok());
    }

    #[test]
    fn rejects_path_separators_and_spaces() {
        assert!(TenantId::parse("a/b").is_err());
        assert!(TenantId::parse("a b").is_err());
        assert!(TenantId::parse("a.b").is_err());
        assert!(TenantId::parse("").is_err());
    }

    #[test]
    fn rejects_overlong() {
        let long = "x".repeat(101);
        assert!(TenantId::parse(&long).is_err());
        let max = "x".repeat(100);
        assert!(TenantId::parse(&max).is_ok());
    }

    #[test]
    fn collection_name_is_prefixed() {
        let t = TenantId::parse("acme").unwrap();
        assert_eq!(t.collection_name("chatforge"), "chatforge_acme");
    }
}

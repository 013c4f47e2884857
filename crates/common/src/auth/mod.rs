//! Authentication utilities
//!
//! Provides:
//! - JWT token generation and validation for the admin surface
//! - Bearer token extraction
//!
//! End-user authentication happens upstream of this service; only the
//! tenant-admin routes verify a token here.

use crate::errors::{AppError, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID)
    pub sub: String,

    /// Tenant ID ("*" for cross-tenant admin tokens)
    pub tenant_id: String,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl JwtClaims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "admin")
    }

    /// Whether this token may operate on the given tenant.
    pub fn allows_tenant(&self, tenant: &str) -> bool {
        self.tenant_id == "*" || self.tenant_id == tenant
    }
}

/// JWT token manager
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiration_secs: i64,
}

impl JwtManager {
    /// Create a new JWT manager with the given secret
    pub fn new(secret: &str, expiration_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiration_secs: expiration_secs as i64,
        }
    }

    /// Generate a new JWT token
    pub fn generate_token(
        &self,
        subject: &str,
        tenant_id: &str,
        scopes: Vec<String>,
    ) -> Result<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.expiration_secs);

        let claims = JwtClaims {
            sub: subject.to_string(),
            tenant_id: tenant_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            scopes,
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| AppError::Internal {
            message: format!("Failed to generate token: {}", e),
        })
    }

    /// Validate and decode a JWT token
    pub fn validate_token(&self, token: &str) -> Result<JwtClaims> {
        decode::<JwtClaims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AppError::ExpiredToken,
                _ => AppError::InvalidToken,
            })
    }
}

/// Extract a bearer token from an Authorization header value
pub fn extract_bearer(auth_header: &str) -> Option<&str> {
    auth_header.strip_prefix("Bearer ")
}

/// Validate the Authorization header against the manager, requiring the
/// `admin` scope. When no manager is configured the check is skipped
/// (development mode).
pub fn require_admin(manager: Option<&JwtManager>, auth_header: Option<&str>) -> Result<()> {
    let Some(manager) = manager else {
        return Ok(());
    };

    let header = auth_header.ok_or_else(|| AppError::Unauthorized {
        message: "Missing Authorization header".to_string(),
    })?;

    let token = extract_bearer(header).ok_or_else(|| AppError::Unauthorized {
        message: "Expected Bearer token".to_string(),
    })?;

    let claims = manager.validate_token(token)?;
    if !claims.has_scope("admin") {
        return Err(AppError::Forbidden {
            message: "Admin scope required".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer tok_123"), Some("tok_123"));
        assert_eq!(extract_bearer("tok_123"), None);
        assert_eq!(extract_bearer("Basic abc"), None);
    }

    #[test]
    fn test_jwt_roundtrip() {
        let manager = JwtManager::new("test_secret", 3600);

        let scopes = vec!["admin".to_string()];
        let token = manager.generate_token("ops", "*", scopes.clone()).unwrap();
        let claims = manager.validate_token(&token).unwrap();

        assert_eq!(claims.sub, "ops");
        assert!(claims.allows_tenant("acme"));
        assert!(claims.has_scope("read"));
    }

    #[test]
    fn test_invalid_token_rejected() {
        let manager = JwtManager::new("test_secret", 3600);
        assert!(matches!(
            manager.validate_token("garbage"),
            Err(AppError::InvalidToken)
        ));
    }

    #[test]
    fn test_require_admin() {
        let manager = JwtManager::new("s", 3600);
        let token = manager
            .generate_token("ops", "*", vec!["admin".into()])
            .unwrap();
        let header = format!("Bearer {token}");

        assert!(require_admin(Some(&manager), Some(&header)).is_ok());
        assert!(require_admin(Some(&manager), None).is_err());
        assert!(require_admin(None, None).is_ok());

        let read_only = manager
            .generate_token("ops", "*", vec!["read".into()])
            .unwrap();
        let header = format!("Bearer {read_only}");
        assert!(matches!(
            require_admin(Some(&manager), Some(&header)),
            Err(AppError::Forbidden { .. })
        ));
    }
}

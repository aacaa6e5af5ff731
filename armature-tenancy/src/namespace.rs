//! Namespace Validation
//!
//! A namespace is the schema (PostgreSQL) or database (MySQL) that holds a
//! tenant's private tables. Its name is interpolated into DDL, where bind
//! parameters are not allowed, so every identifier passes through
//! [`validate`] before any statement is built from it.
//!
//! ```
//! use armature_tenancy::namespace;
//!
//! assert!(namespace::validate("tenant1").is_ok());
//! assert!(namespace::validate("pg_tenant").is_err());
//! ```

use crate::error::{TenancyError, TenancyResult};
use once_cell::sync::Lazy;
use regex::Regex;

/// Environment variable overriding the public namespace name.
pub const PUBLIC_SCHEMA_ENV: &str = "GMT_PUBLIC_SCHEMA_NAME";

/// Public namespace name used when the environment does not override it.
pub const DEFAULT_PUBLIC_SCHEMA: &str = "public";

/// Prefix PostgreSQL reserves for system schemas.
pub const RESERVED_PREFIX: &str = "pg_";

static NAMESPACE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[_a-zA-Z][_a-zA-Z0-9]{2,}$").expect("valid namespace regex"));

/// Validate a tenant namespace identifier.
///
/// Fails with [`TenancyError::InvalidTenant`] for an empty name,
/// [`TenancyError::InvalidPattern`] when the name does not match
/// `^[_a-zA-Z][_a-zA-Z0-9]{2,}$`, and [`TenancyError::ReservedPrefix`] when it
/// starts with `pg_`. The reserved prefix is rejected on every backend.
pub fn validate(name: &str) -> TenancyResult<()> {
    if name.is_empty() {
        return Err(TenancyError::InvalidTenant);
    }

    if !NAMESPACE_PATTERN.is_match(name) {
        return Err(TenancyError::InvalidPattern(name.to_string()));
    }

    if name.starts_with(RESERVED_PREFIX) {
        return Err(TenancyError::ReservedPrefix(name.to_string()));
    }

    Ok(())
}

/// The public namespace name, read from `GMT_PUBLIC_SCHEMA_NAME`.
///
/// Falls back to `"public"` when the variable is unset or blank.
pub fn public_schema_name() -> String {
    public_schema_from(std::env::var(PUBLIC_SCHEMA_ENV).ok())
}

fn public_schema_from(value: Option<String>) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_PUBLIC_SCHEMA.to_string())
}

/// Prefix that shared table names must carry, e.g. `"public."`.
pub fn shared_table_prefix(public_schema: &str) -> String {
    format!("{public_schema}.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["tenant1", "_t1", "abc", "Acme_Corp", "tenant_2024", "___"] {
            assert!(validate(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(validate("ab"), Err(TenancyError::InvalidPattern(_))));
    }

    #[test]
    fn test_leading_digit() {
        assert!(matches!(validate("1abc"), Err(TenancyError::InvalidPattern(_))));
    }

    #[test]
    fn test_reserved_prefix() {
        assert!(matches!(
            validate("pg_tenant"),
            Err(TenancyError::ReservedPrefix(_))
        ));
    }

    #[test]
    fn test_empty_is_invalid_tenant() {
        assert!(matches!(validate(""), Err(TenancyError::InvalidTenant)));
    }

    #[test]
    fn test_rejects_injection_attempts() {
        for name in [
            "acme; DROP SCHEMA public",
            "acme\"",
            "acme`",
            "ac-me",
            "acme.books",
            "tenant 1",
        ] {
            assert!(
                matches!(validate(name), Err(TenancyError::InvalidPattern(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn test_public_schema_override() {
        assert_eq!(public_schema_from(None), "public");
        assert_eq!(public_schema_from(Some(String::new())), "public");
        assert_eq!(public_schema_from(Some("  ".to_string())), "public");
        assert_eq!(public_schema_from(Some(" shared ".to_string())), "shared");
    }

    #[test]
    fn test_shared_table_prefix() {
        assert_eq!(shared_table_prefix("public"), "public.");
        assert_eq!(shared_table_prefix("shared"), "shared.");
    }
}

//! PostgreSQL: schema per tenant.

use super::BackendOps;
use crate::lock::{AdvisoryLock, PgAdvisoryXactLock};

/// PostgreSQL backend. Tenants are schemas, switched with `search_path`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres {
    lock: PgAdvisoryXactLock,
}

impl Postgres {
    /// Create the backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackendOps for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn create_namespace_sql(&self, namespace: &str) -> String {
        format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            self.quote_identifier(namespace)
        )
    }

    fn drop_namespace_sql(&self, namespace: &str) -> String {
        format!(
            "DROP SCHEMA IF EXISTS {} CASCADE",
            self.quote_identifier(namespace)
        )
    }

    fn use_namespace_sql(&self, namespace: &str) -> String {
        format!("SET search_path TO {}", self.quote_identifier(namespace))
    }

    fn current_namespace_sql(&self) -> &'static str {
        "SELECT current_schema()"
    }

    fn lock(&self) -> &dyn AdvisoryLock {
        &self.lock
    }

    fn namespace_check_sql(&self, column: &str) -> String {
        let column = self.quote_identifier(column);
        format!(
            "CHECK ({column} ~ '^[_a-zA-Z][_a-zA-Z0-9]{{2,}}$' AND {column} !~ '^pg_')"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockScope;

    #[test]
    fn test_statements() {
        let pg = Postgres::new();
        assert_eq!(
            pg.create_namespace_sql("acme"),
            r#"CREATE SCHEMA IF NOT EXISTS "acme""#
        );
        assert_eq!(
            pg.drop_namespace_sql("acme"),
            r#"DROP SCHEMA IF EXISTS "acme" CASCADE"#
        );
        assert_eq!(pg.use_namespace_sql("acme"), r#"SET search_path TO "acme""#);
        assert_eq!(pg.current_namespace_sql(), "SELECT current_schema()");
        assert_eq!(pg.lock().scope(), LockScope::Transaction);
    }

    #[test]
    fn test_quote_escapes_embedded_quotes() {
        let pg = Postgres::new();
        assert_eq!(pg.quote_identifier(r#"ac"me"#), r#""ac""me""#);
    }

    #[test]
    fn test_check_constraint() {
        assert_eq!(
            Postgres::new().namespace_check_sql("schema_name"),
            r#"CHECK ("schema_name" ~ '^[_a-zA-Z][_a-zA-Z0-9]{2,}$' AND "schema_name" !~ '^pg_')"#
        );
    }
}

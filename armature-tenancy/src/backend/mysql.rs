//! MySQL: database per tenant.

use super::BackendOps;
use crate::lock::{AdvisoryLock, MySqlNamedLock};

/// MySQL backend. Tenants are databases, switched with `USE`.
///
/// MySQL commits DDL implicitly, so a failed tenant migration can leave a
/// created database behind; rerunning the migration is safe because every
/// statement is `IF NOT EXISTS`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySql {
    lock: MySqlNamedLock,
}

impl MySql {
    /// Create the backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackendOps for MySql {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn create_namespace_sql(&self, namespace: &str) -> String {
        format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            self.quote_identifier(namespace)
        )
    }

    fn drop_namespace_sql(&self, namespace: &str) -> String {
        format!("DROP DATABASE IF EXISTS {}", self.quote_identifier(namespace))
    }

    fn use_namespace_sql(&self, namespace: &str) -> String {
        format!("USE {}", self.quote_identifier(namespace))
    }

    fn current_namespace_sql(&self) -> &'static str {
        "SELECT DATABASE()"
    }

    fn lock(&self) -> &dyn AdvisoryLock {
        &self.lock
    }

    fn namespace_check_sql(&self, column: &str) -> String {
        let column = self.quote_identifier(column);
        format!(
            "CHECK (REGEXP_LIKE({column}, '^[_a-zA-Z][_a-zA-Z0-9]{{2,}}$', 'c') AND {column} NOT LIKE 'pg\\_%')"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockScope;

    #[test]
    fn test_statements() {
        let mysql = MySql::new();
        assert_eq!(
            mysql.create_namespace_sql("acme"),
            "CREATE DATABASE IF NOT EXISTS `acme`"
        );
        assert_eq!(mysql.drop_namespace_sql("acme"), "DROP DATABASE IF EXISTS `acme`");
        assert_eq!(mysql.use_namespace_sql("acme"), "USE `acme`");
        assert_eq!(mysql.current_namespace_sql(), "SELECT DATABASE()");
        assert_eq!(mysql.lock().scope(), LockScope::Session);
    }

    #[test]
    fn test_quote_escapes_backticks() {
        assert_eq!(MySql::new().quote_identifier("ac`me"), "`ac``me`");
    }

    #[test]
    fn test_check_constraint() {
        let sql = MySql::new().namespace_check_sql("id");
        assert!(sql.starts_with("CHECK (REGEXP_LIKE(`id`, '^[_a-zA-Z][_a-zA-Z0-9]{2,}$', 'c')"));
        assert!(sql.ends_with("`id` NOT LIKE 'pg\\_%')"));
    }
}

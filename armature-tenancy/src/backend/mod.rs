//! Backend Adapters
//!
//! A backend knows how to spell namespace DDL, namespace switching and
//! advisory locking for one database engine. Backends are looked up by
//! connection-string scheme through a [`BackendRegistry`], so new engines
//! can be plugged in without touching the lifecycle facade.
//!
//! ```
//! use armature_tenancy::backend::default_registry;
//!
//! let pg = default_registry().resolve("postgresql").unwrap();
//! assert_eq!(pg.name(), "postgres");
//! assert_eq!(pg.create_namespace_sql("acme"), r#"CREATE SCHEMA IF NOT EXISTS "acme""#);
//! ```

mod mysql;
mod postgres;

pub use mysql::MySql;
pub use postgres::Postgres;

use crate::error::{TenancyError, TenancyResult};
use crate::lock::AdvisoryLock;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Engine-specific SQL and locking for tenant namespaces.
///
/// Namespace arguments are expected to have passed
/// [`namespace::validate`](crate::namespace::validate); they are quoted
/// regardless.
pub trait BackendOps: Send + Sync + fmt::Debug {
    /// Canonical backend name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Quote a single identifier.
    fn quote_identifier(&self, ident: &str) -> String;

    /// Quote a possibly qualified table name part by part.
    fn quote_table(&self, table: &str) -> String {
        table
            .split('.')
            .map(|part| self.quote_identifier(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Statement creating a namespace if absent.
    fn create_namespace_sql(&self, namespace: &str) -> String;

    /// Statement dropping a namespace and everything in it, if present.
    fn drop_namespace_sql(&self, namespace: &str) -> String;

    /// Statement making `namespace` the connection's active namespace.
    fn use_namespace_sql(&self, namespace: &str) -> String;

    /// Query returning the active namespace, or `NULL`.
    fn current_namespace_sql(&self) -> &'static str;

    /// Advisory lock primitive.
    fn lock(&self) -> &dyn AdvisoryLock;

    /// Check constraint enforcing the namespace naming rules on `column`.
    fn namespace_check_sql(&self, column: &str) -> String;
}

/// Scheme to backend mapping.
///
/// Registration is expected at startup; lookups may run concurrently.
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Arc<dyn BackendOps>>>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry with PostgreSQL and MySQL registered under their
    /// common schemes.
    pub fn with_defaults() -> Self {
        let registry = Self::new();

        let postgres: Arc<dyn BackendOps> = Arc::new(Postgres::new());
        registry.register("postgres", Arc::clone(&postgres));
        registry.register("postgresql", postgres);

        let mysql: Arc<dyn BackendOps> = Arc::new(MySql::new());
        registry.register("mysql", Arc::clone(&mysql));
        registry.register("mariadb", mysql);

        registry
    }

    /// Register (or replace) the backend for `scheme`.
    pub fn register(&self, scheme: &str, backend: Arc<dyn BackendOps>) {
        self.backends
            .write()
            .insert(scheme.to_ascii_lowercase(), backend);
    }

    /// Look up the backend for `scheme`.
    pub fn resolve(&self, scheme: &str) -> TenancyResult<Arc<dyn BackendOps>> {
        self.backends
            .read()
            .get(&scheme.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| TenancyError::UnknownBackend(scheme.to_string()))
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<_> = self.backends.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

static DEFAULT_REGISTRY: Lazy<BackendRegistry> = Lazy::new(BackendRegistry::with_defaults);

/// Process-wide registry with the built-in backends.
///
/// A convenience for [`TenantDb::open`](crate::TenantDb::open); pass an
/// explicit registry to [`TenantDb::open_with`](crate::TenantDb::open_with)
/// to avoid shared state.
pub fn default_registry() -> &'static BackendRegistry {
    &DEFAULT_REGISTRY
}

//! Error types for tenant lifecycle management.

use crate::model::ModelError;
use thiserror::Error;

/// Errors produced by namespace validation, model registration, locking,
/// migration and tenant scoping.
#[derive(Error, Debug)]
pub enum TenancyError {
    /// Tenant identifier was empty.
    #[error("invalid tenant: identifier is empty")]
    InvalidTenant,

    /// Identifier does not match `^[_a-zA-Z][_a-zA-Z0-9]{2,}$`.
    #[error("invalid tenant identifier `{0}`: must start with a letter or underscore and contain at least 3 alphanumeric or underscore characters")]
    InvalidPattern(String),

    /// Identifier uses the reserved `pg_` prefix.
    #[error("invalid tenant identifier `{0}`: the `pg_` prefix is reserved")]
    ReservedPrefix(String),

    /// One or more models violate the table naming convention.
    #[error("invalid models:\n{}", join_lines(.0))]
    InvalidModels(Vec<ModelError>),

    /// Shared migration attempted without shared models.
    #[error("no public tables to migrate")]
    NoPublicModels,

    /// Tenant migration attempted without tenant models.
    #[error("no tenant tables to migrate")]
    NoTenantModels,

    /// Migration attempted before any model was registered.
    #[error("no models registered: call register_models before migrating")]
    NotRegistered,

    /// The auto-migrate primitive was invoked outside a migration session.
    #[error("invalid migration: {0}")]
    InvalidMigration(String),

    /// A single lock attempt did not obtain the lock.
    #[error("lock `{0}` is held by another session")]
    LockNotAcquired(String),

    /// Lock acquisition gave up.
    #[error("failed to acquire lock `{key}` after {attempts} attempt(s): {source}")]
    AcquireLockFailed {
        /// Lock key.
        key: String,
        /// Attempts made.
        attempts: u32,
        /// Last underlying error.
        #[source]
        source: Box<TenancyError>,
    },

    /// The engine reported the lock was not held on release.
    #[error("failed to release lock `{0}`: lock was not held by this session")]
    ReleaseLockFailed(String),

    /// Operation needs a transaction but the connection has none open.
    #[error("{0} requires an open transaction")]
    TransactionRequired(&'static str),

    /// Error reported by the SQL execution layer.
    #[error("database error: {0}")]
    Database(String),

    /// A retried operation kept failing.
    #[error("giving up after {attempts} attempt(s): {source}")]
    RetryExhausted {
        /// Attempts made.
        attempts: u32,
        /// Last underlying error.
        #[source]
        source: Box<TenancyError>,
    },

    /// Scoped work failed and resetting the namespace failed as well.
    #[error("{error} (additionally, resetting the tenant context failed: {reset})")]
    ScopeAndReset {
        /// Error returned by the scoped closure.
        error: Box<TenancyError>,
        /// Error returned by the reset.
        reset: Box<TenancyError>,
    },

    /// No backend is registered for the connection scheme.
    #[error("unknown backend `{0}`")]
    UnknownBackend(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Context wrapper naming the backend, operation and namespace.
    #[error("{backend}: {operation} `{namespace}`: {source}")]
    Operation {
        /// Backend name.
        backend: &'static str,
        /// Operation being performed.
        operation: &'static str,
        /// Tenant or public namespace.
        namespace: String,
        /// Underlying error.
        #[source]
        source: Box<TenancyError>,
    },
}

/// Result type alias for tenancy operations.
pub type TenancyResult<T> = Result<T, TenancyError>;

impl TenancyError {
    /// Whether retrying the failed operation can succeed.
    ///
    /// Only driver errors and lost lock races are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            TenancyError::Database(_) | TenancyError::LockNotAcquired(_) => true,
            TenancyError::Operation { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// The innermost error, skipping context and retry wrappers.
    pub fn root(&self) -> &TenancyError {
        match self {
            TenancyError::Operation { source, .. } | TenancyError::RetryExhausted { source, .. } => {
                source.root()
            }
            other => other,
        }
    }

    /// Wrap with backend, operation and namespace context.
    pub fn context(
        self,
        backend: &'static str,
        operation: &'static str,
        namespace: impl Into<String>,
    ) -> Self {
        TenancyError::Operation {
            backend,
            operation,
            namespace: namespace.into(),
            source: Box::new(self),
        }
    }
}

fn join_lines(errors: &[ModelError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

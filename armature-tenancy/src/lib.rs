//! Multi-Tenancy for Armature
//!
//! Schema-per-tenant (PostgreSQL) and database-per-tenant (MySQL) lifecycle
//! management: onboarding a tenant creates its namespace and migrates its
//! private tables, offboarding drops the namespace, and tenant scoping
//! switches a connection between a tenant's namespace and the shared public
//! one.
//!
//! # Features
//!
//! - 🏷️ **Namespace Validation** - Tenant identifiers are checked before any DDL
//! - 🗂️ **Model Registry** - Shared vs. tenant tables, validated at registration
//! - 🔒 **Advisory Locks** - Same-tenant migrations serialize across processes
//! - 🔁 **Retry with Backoff** - Lock contention and transient failures retried
//! - 🚦 **Gated Migrations** - Auto-migrate only runs inside a migration session
//! - 🔀 **Tenant Scoping** - Switch and reliably reset a connection's namespace
//! - 🔌 **Pluggable Backends** - Register new engines by connection scheme
//!
//! # Quick Start
//!
//! ## 1. Implement the SQL collaborators
//!
//! ```rust,ignore
//! use armature_tenancy::*;
//!
//! // Forward statements to your driver
//! #[async_trait]
//! impl TenantConnection for MyConnection {
//!     async fn execute(&mut self, sql: &str) -> TenancyResult<u64> { /* ... */ }
//!     // ...
//! }
//!
//! // Create or alter tables; only reachable through a MigrationSession
//! #[async_trait]
//! impl SchemaMigrator for MyOrmMigrator {
//!     async fn migrate(
//!         &self,
//!         session: &MigrationSession,
//!         conn: &mut dyn TenantConnection,
//!         models: &[ModelRef],
//!     ) -> TenancyResult<()> {
//!         /* ... */
//!     }
//! }
//! ```
//!
//! ## 2. Register models and migrate
//!
//! ```rust,ignore
//! let db = TenantDb::open("postgres://app@localhost/app", Arc::new(MyOrmMigrator))?;
//!
//! db.register_models(vec![
//!     Arc::new(Tenant::default()) as ModelRef, // table "public.tenants"
//!     Arc::new(Book::default()) as ModelRef,   // table "books"
//! ])?;
//!
//! db.migrate_shared_models(&mut conn).await?;
//! db.migrate_tenant_models(&mut conn, "acme").await?;
//! ```
//!
//! ## 3. Scope queries to a tenant
//!
//! ```rust,ignore
//! let books = db
//!     .with_tenant(&mut conn, "acme", |conn| {
//!         Box::pin(async move { conn.query_value("SELECT COUNT(*) FROM books", &[]).await })
//!     })
//!     .await?;
//! ```
//!
//! ## 4. Offboard
//!
//! ```rust,ignore
//! db.offboard_tenant(&mut conn, "acme").await?;
//! ```
//!
//! # Environment Variables
//!
//! - `GMT_PUBLIC_SCHEMA_NAME` - Public namespace name (default `public`)
//! - `GMT_DEBUG=1` - Enable lifecycle logging
//!
//! # Cargo Features
//!
//! - `testing` - In-memory `MockServer` for tests without a database

pub mod backend;
pub mod config;
pub mod connection;
pub mod context;
pub mod db;
pub mod error;
pub mod lock;
pub mod logging;
pub mod migration;
pub mod model;
pub mod namespace;
pub mod retry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{BackendOps, BackendRegistry, MySql, Postgres, default_registry};
pub use config::TenancyConfig;
pub use connection::{ConnFuture, SqlValue, TenantConnection};
pub use context::{TenantContext, TenantReset};
pub use db::TenantDb;
pub use error::{TenancyError, TenancyResult};
pub use lock::{AdvisoryLock, LockHandle, LockScope, MySqlNamedLock, PgAdvisoryXactLock};
pub use migration::{
    GatedMigrator, MigrationEngine, MigrationMode, MigrationReport, MigrationSession,
    MigrationState, SchemaMigrator,
};
pub use model::{
    ModelDescriptor, ModelError, ModelRef, ModelRegistry, TenantModel, TenantPkModel,
    TenantTabler,
};
pub use retry::RetryPolicy;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::BackendOps;
    pub use crate::connection::{ConnFuture, SqlValue, TenantConnection};
    pub use crate::context::TenantReset;
    pub use crate::db::TenantDb;
    pub use crate::error::{TenancyError, TenancyResult};
    pub use crate::migration::{MigrationSession, SchemaMigrator};
    pub use crate::model::{ModelDescriptor, ModelRef, TenantTabler};
    pub use crate::retry::RetryPolicy;
}

//! Tenant Lifecycle Facade
//!
//! [`TenantDb`] ties the pieces together for one database: it resolves the
//! backend from the connection string once, keeps the registered models,
//! and exposes onboarding, offboarding and tenant scoping.
//!
//! # Usage
//!
//! ```rust,ignore
//! let db = TenantDb::open("postgres://app@localhost/app", Arc::new(MyMigrator))?;
//!
//! db.register_models(vec![
//!     Arc::new(ModelDescriptor::shared("public.tenants")) as ModelRef,
//!     Arc::new(ModelDescriptor::tenant("books")) as ModelRef,
//! ])?;
//!
//! db.migrate_shared_models(&mut conn).await?;
//! db.migrate_tenant_models(&mut conn, "acme").await?;
//!
//! let reset = db.use_tenant(&mut conn, "acme").await?;
//! // ... tenant-scoped queries ...
//! reset.reset(&mut conn).await?;
//!
//! db.offboard_tenant(&mut conn, "acme").await?;
//! ```

use crate::backend::{BackendOps, BackendRegistry, default_registry};
use crate::config::TenancyConfig;
use crate::connection::{ConnFuture, TenantConnection};
use crate::context::{TenantContext, TenantReset};
use crate::error::{TenancyError, TenancyResult};
use crate::logging::{debug, info};
use crate::migration::{MigrationEngine, MigrationReport, SchemaMigrator};
use crate::model::{ModelRef, ModelRegistry};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Multitenant handle for one database.
///
/// Safe to share between tasks. Each task must bring its own connection:
/// tenant scoping is connection state.
pub struct TenantDb {
    config: TenancyConfig,
    backend: Arc<dyn BackendOps>,
    engine: MigrationEngine,
    context: TenantContext,
    models: RwLock<Option<Arc<ModelRegistry>>>,
}

impl TenantDb {
    /// Open with the process-wide [`default_registry`].
    pub fn open(dsn: &str, migrator: Arc<dyn SchemaMigrator>) -> TenancyResult<Self> {
        let config = TenancyConfig::parse(dsn)?;
        Self::open_with(default_registry(), config, migrator)
    }

    /// Open with an explicit backend registry and configuration.
    pub fn open_with(
        backends: &BackendRegistry,
        config: TenancyConfig,
        migrator: Arc<dyn SchemaMigrator>,
    ) -> TenancyResult<Self> {
        let backend = backends.resolve(config.scheme())?;

        let engine = MigrationEngine::new(
            Arc::clone(&backend),
            migrator,
            config.retry_policy(),
            config.public_schema(),
        );
        let context = TenantContext::new(Arc::clone(&backend), config.public_schema());

        info!(
            backend = backend.name(),
            public = config.public_schema(),
            retry = config.retry_policy().is_some(),
            "opened multitenant database"
        );

        Ok(Self {
            config,
            backend,
            engine,
            context,
            models: RwLock::new(None),
        })
    }

    /// Validate and register the models, replacing any earlier registration.
    ///
    /// Registration is meant to happen once at startup, before migrations
    /// or scoped queries run concurrently.
    pub fn register_models(&self, models: Vec<ModelRef>) -> TenancyResult<()> {
        let registry = ModelRegistry::new(models, self.public_schema())?;

        debug!(
            backend = self.backend.name(),
            shared = registry.shared_models().len(),
            tenant = registry.tenant_models().len(),
            "registered models"
        );

        *self.models.write() = Some(Arc::new(registry));
        Ok(())
    }

    /// The registered models, if any.
    pub fn models(&self) -> Option<Arc<ModelRegistry>> {
        self.models.read().clone()
    }

    fn registered(&self) -> TenancyResult<Arc<ModelRegistry>> {
        self.models().ok_or(TenancyError::NotRegistered)
    }

    /// Create the public namespace and migrate the shared models into it.
    pub async fn migrate_shared_models(
        &self,
        conn: &mut dyn TenantConnection,
    ) -> TenancyResult<MigrationReport> {
        let models = self.registered()?;
        self.engine.migrate_shared(conn, &models).await
    }

    /// Create `tenant`'s namespace if needed and migrate the tenant models
    /// into it.
    pub async fn migrate_tenant_models(
        &self,
        conn: &mut dyn TenantConnection,
        tenant: &str,
    ) -> TenancyResult<MigrationReport> {
        let models = self.registered()?;
        self.engine.migrate_tenant(conn, &models, tenant).await
    }

    /// Drop `tenant`'s namespace and every table in it.
    pub async fn offboard_tenant(
        &self,
        conn: &mut dyn TenantConnection,
        tenant: &str,
    ) -> TenancyResult<()> {
        self.engine.offboard(conn, tenant).await
    }

    /// Scope the connection to `tenant`. See [`TenantContext::use_tenant`].
    pub async fn use_tenant(
        &self,
        conn: &mut dyn TenantConnection,
        tenant: &str,
    ) -> TenancyResult<TenantReset> {
        self.context.use_tenant(conn, tenant).await
    }

    /// Run `f` scoped to `tenant`. See [`TenantContext::with_tenant`].
    pub async fn with_tenant<T, F>(
        &self,
        conn: &mut dyn TenantConnection,
        tenant: &str,
        f: F,
    ) -> TenancyResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut dyn TenantConnection) -> ConnFuture<'c, T> + Send,
    {
        self.context.with_tenant(conn, tenant, f).await
    }

    /// The connection's active tenant, or the public namespace.
    pub async fn current_tenant(&self, conn: &mut dyn TenantConnection) -> TenancyResult<String> {
        self.context.current_tenant(conn).await
    }

    /// Quoted `tenant.table` reference.
    pub fn qualified_table(&self, tenant: &str, table: &str) -> TenancyResult<String> {
        self.context.qualified_table(tenant, table)
    }

    /// Direct auto-migrate. Always fails with
    /// [`TenancyError::InvalidMigration`]; use [`Self::migrate_shared_models`]
    /// or [`Self::migrate_tenant_models`].
    pub async fn auto_migrate(
        &self,
        conn: &mut dyn TenantConnection,
        models: &[ModelRef],
    ) -> TenancyResult<()> {
        self.engine.auto_migrate(conn, models).await
    }

    /// Backend name.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Backend adapter.
    pub fn backend(&self) -> &dyn BackendOps {
        self.backend.as_ref()
    }

    /// Public namespace name.
    pub fn public_schema(&self) -> &str {
        self.config.public_schema()
    }

    /// Parsed configuration.
    pub fn config(&self) -> &TenancyConfig {
        &self.config
    }
}

impl fmt::Debug for TenantDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantDb")
            .field("backend", &self.backend.name())
            .field("public_schema", &self.public_schema())
            .field("models", &self.models.read())
            .finish()
    }
}

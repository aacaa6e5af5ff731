//! Migration Engine
//!
//! Runs the two migration phases:
//!
//! - **shared**: shared models into the public namespace, once per deployment;
//! - **tenant**: tenant models into one tenant's namespace, once per tenant.
//!
//! Each run creates its namespace (`IF NOT EXISTS`), takes the advisory lock
//! keyed by that namespace, and hands the models to the external
//! [`SchemaMigrator`] inside a [`MigrationSession`]. The session can only be
//! created here, so the auto-migrate primitive cannot be reached any other
//! way.
//!
//! When the connection is not already in a transaction the run gets its own,
//! and transient failures restart the whole run in a fresh transaction per the
//! retry policy. Inside a caller's transaction the run executes directly and
//! is never retried; the caller owns commit, rollback and retry.

use crate::backend::BackendOps;
use crate::connection::TenantConnection;
use crate::error::{TenancyError, TenancyResult};
use crate::lock;
use crate::logging::{debug, info, log_warn};
use crate::model::{ModelRef, ModelRegistry};
use crate::namespace;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Which phase a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    /// Shared models into the public namespace.
    Shared,
    /// Tenant models into a tenant namespace.
    Tenant,
}

/// Progress of a single migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Nothing executed yet.
    NotStarted,
    /// Namespace exists.
    SchemaCreated,
    /// Advisory lock held.
    LockAcquired,
    /// Auto-migrate running.
    Migrating,
    /// Changes committed (or handed back to the caller's transaction).
    Committed,
    /// Rolled back.
    Failed,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationState::NotStarted => "not_started",
            MigrationState::SchemaCreated => "schema_created",
            MigrationState::LockAcquired => "lock_acquired",
            MigrationState::Migrating => "migrating",
            MigrationState::Committed => "committed",
            MigrationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Capability token required by [`SchemaMigrator::migrate`].
///
/// Only the engine constructs sessions.
pub struct MigrationSession {
    run_id: Uuid,
    mode: MigrationMode,
    namespace: String,
    backend: Arc<dyn BackendOps>,
}

impl MigrationSession {
    fn new(mode: MigrationMode, namespace: &str, backend: Arc<dyn BackendOps>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            namespace: namespace.to_string(),
            backend,
        }
    }

    /// Identifier of this run, for log correlation.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Phase.
    pub fn mode(&self) -> MigrationMode {
        self.mode
    }

    /// Namespace being migrated.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Backend, for identifier quoting.
    pub fn backend(&self) -> &dyn BackendOps {
        self.backend.as_ref()
    }

    fn admit(&self, models: &[ModelRef]) -> TenancyResult<()> {
        let expect_shared = self.mode == MigrationMode::Shared;
        if let Some(model) = models.iter().find(|m| m.is_shared_model() != expect_shared) {
            return Err(TenancyError::InvalidMigration(format!(
                "model `{}` does not belong to a {:?} migration",
                model.table_name(),
                self.mode
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for MigrationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationSession")
            .field("run_id", &self.run_id)
            .field("mode", &self.mode)
            .field("namespace", &self.namespace)
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// The auto-migrate primitive: create or alter tables for `models`.
///
/// Supplied by the ORM layer. Tables of tenant models are unqualified and
/// land in the namespace the connection is switched to; shared model tables
/// carry the public prefix.
#[async_trait]
pub trait SchemaMigrator: Send + Sync {
    /// Bring the tables for `models` up to date.
    async fn migrate(
        &self,
        session: &MigrationSession,
        conn: &mut dyn TenantConnection,
        models: &[ModelRef],
    ) -> TenancyResult<()>;
}

/// Gate in front of the [`SchemaMigrator`].
#[derive(Clone)]
pub struct GatedMigrator {
    inner: Arc<dyn SchemaMigrator>,
}

impl GatedMigrator {
    /// Wrap a migrator.
    pub fn new(inner: Arc<dyn SchemaMigrator>) -> Self {
        Self { inner }
    }

    /// Run auto-migrate.
    ///
    /// Fails with [`TenancyError::InvalidMigration`] without a session, or
    /// when a model's classification does not match the session's phase.
    pub async fn auto_migrate(
        &self,
        session: Option<&MigrationSession>,
        conn: &mut dyn TenantConnection,
        models: &[ModelRef],
    ) -> TenancyResult<()> {
        let session = session.ok_or_else(|| {
            TenancyError::InvalidMigration(
                "auto-migrate must run through migrate_shared_models or migrate_tenant_models"
                    .to_string(),
            )
        })?;
        session.admit(models)?;
        self.inner.migrate(session, conn, models).await
    }
}

impl fmt::Debug for GatedMigrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatedMigrator").finish_non_exhaustive()
    }
}

/// Outcome of a successful migration.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    /// Session identifier of the successful attempt.
    pub run_id: Uuid,
    /// Phase.
    pub mode: MigrationMode,
    /// Namespace migrated.
    pub namespace: String,
    /// Tables handed to the migrator.
    pub models: Vec<String>,
    /// Attempts used, counting the first.
    pub attempts: u32,
    /// Start of the first attempt.
    pub started_at: DateTime<Utc>,
    /// End of the successful attempt.
    pub finished_at: DateTime<Utc>,
}

enum Job<'a> {
    Shared(&'a [ModelRef]),
    Tenant(&'a str, &'a [ModelRef]),
    Offboard(&'a str),
}

impl Job<'_> {
    fn operation(&self) -> &'static str {
        match self {
            Job::Shared(_) => "migrate shared models",
            Job::Tenant(..) => "migrate tenant models",
            Job::Offboard(_) => "offboard tenant",
        }
    }
}

/// Orchestrates shared and tenant migrations and offboarding.
#[derive(Debug, Clone)]
pub struct MigrationEngine {
    backend: Arc<dyn BackendOps>,
    migrator: GatedMigrator,
    retry: Option<RetryPolicy>,
    public_schema: String,
}

impl MigrationEngine {
    /// Create an engine.
    pub fn new(
        backend: Arc<dyn BackendOps>,
        migrator: Arc<dyn SchemaMigrator>,
        retry: Option<RetryPolicy>,
        public_schema: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            migrator: GatedMigrator::new(migrator),
            retry,
            public_schema: public_schema.into(),
        }
    }

    /// Public namespace name.
    pub fn public_schema(&self) -> &str {
        &self.public_schema
    }

    /// Migrate the shared models into the public namespace.
    pub async fn migrate_shared(
        &self,
        conn: &mut dyn TenantConnection,
        registry: &ModelRegistry,
    ) -> TenancyResult<MigrationReport> {
        let models = registry.shared_models();
        if models.is_empty() {
            return Err(TenancyError::NoPublicModels);
        }

        let public = self.public_schema.clone();
        self.run_migration(conn, Job::Shared(models), MigrationMode::Shared, &public, models)
            .await
    }

    /// Migrate the tenant models into `tenant`'s namespace, creating it if
    /// needed.
    pub async fn migrate_tenant(
        &self,
        conn: &mut dyn TenantConnection,
        registry: &ModelRegistry,
        tenant: &str,
    ) -> TenancyResult<MigrationReport> {
        namespace::validate(tenant)?;
        if tenant == self.public_schema {
            return Err(TenancyError::InvalidMigration(format!(
                "tenant models cannot be migrated into the public namespace `{tenant}`"
            )));
        }
        let models = registry.tenant_models();
        if models.is_empty() {
            return Err(TenancyError::NoTenantModels);
        }

        self.run_migration(
            conn,
            Job::Tenant(tenant, models),
            MigrationMode::Tenant,
            tenant,
            models,
        )
        .await
    }

    /// Drop `tenant`'s namespace with everything in it.
    ///
    /// Succeeds when the namespace does not exist.
    pub async fn offboard(&self, conn: &mut dyn TenantConnection, tenant: &str) -> TenancyResult<()> {
        namespace::validate(tenant)?;
        if tenant == self.public_schema {
            return Err(TenancyError::InvalidMigration(format!(
                "the public namespace `{tenant}` cannot be offboarded"
            )));
        }

        self.run(conn, &Job::Offboard(tenant), tenant).await?;
        info!(backend = self.backend.name(), tenant, "offboarded tenant");
        Ok(())
    }

    /// The ungated entry point: always fails with
    /// [`TenancyError::InvalidMigration`].
    pub async fn auto_migrate(
        &self,
        conn: &mut dyn TenantConnection,
        models: &[ModelRef],
    ) -> TenancyResult<()> {
        self.migrator.auto_migrate(None, conn, models).await
    }

    async fn run_migration(
        &self,
        conn: &mut dyn TenantConnection,
        job: Job<'_>,
        mode: MigrationMode,
        namespace: &str,
        models: &[ModelRef],
    ) -> TenancyResult<MigrationReport> {
        let started_at = Utc::now();
        let (run_id, attempts) = self.run(conn, &job, namespace).await?;
        let finished_at = Utc::now();

        info!(
            backend = self.backend.name(),
            namespace,
            models = models.len(),
            attempts,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "{} succeeded",
            job.operation()
        );

        Ok(MigrationReport {
            run_id: run_id.unwrap_or_else(Uuid::nil),
            mode,
            namespace: namespace.to_string(),
            models: models.iter().map(|m| m.table_name()).collect(),
            attempts,
            started_at,
            finished_at,
        })
    }

    /// Run `job` with retries, returning the session id and attempt count.
    async fn run(
        &self,
        conn: &mut dyn TenantConnection,
        job: &Job<'_>,
        namespace: &str,
    ) -> TenancyResult<(Option<Uuid>, u32)> {
        let operation = job.operation();
        let retry = if conn.in_transaction() { None } else { self.retry };
        let mut backoff = retry.map(|policy| policy.backoff(operation));

        loop {
            match self.attempt(conn, job, namespace).await {
                Ok(run_id) => return Ok((run_id, backoff.as_ref().map_or(1, |b| b.attempts()))),
                Err(error) => {
                    if error.is_retryable() {
                        if let Some(backoff) = backoff.as_mut() {
                            if backoff.wait(&error).await {
                                continue;
                            }
                        }
                    }

                    log_warn!(
                        backend = self.backend.name(),
                        namespace,
                        error = %error,
                        "{operation} failed"
                    );
                    let error = match backoff.as_ref() {
                        Some(backoff) => backoff.exhausted(error),
                        None => error,
                    };
                    return Err(error.context(self.backend.name(), operation, namespace));
                }
            }
        }
    }

    /// One attempt, in its own transaction unless the caller has one open.
    async fn attempt(
        &self,
        conn: &mut dyn TenantConnection,
        job: &Job<'_>,
        namespace: &str,
    ) -> TenancyResult<Option<Uuid>> {
        let owns_transaction = !conn.in_transaction();
        if owns_transaction {
            conn.begin().await?;
        }

        let result = match job {
            Job::Shared(models) => self.shared_steps(conn, models).await.map(Some),
            Job::Tenant(tenant, models) => self.tenant_steps(conn, tenant, models).await.map(Some),
            Job::Offboard(tenant) => self.offboard_steps(conn, tenant).await.map(|_| None),
        };

        let result = finish_transaction(conn, owns_transaction, result).await;
        let state = if result.is_ok() {
            MigrationState::Committed
        } else {
            MigrationState::Failed
        };
        self.log_state(namespace, state);
        result
    }

    async fn shared_steps(
        &self,
        conn: &mut dyn TenantConnection,
        models: &[ModelRef],
    ) -> TenancyResult<Uuid> {
        let public = self.public_schema.as_str();

        conn.execute(&self.backend.create_namespace_sql(public)).await?;
        self.log_state(public, MigrationState::SchemaCreated);

        let guard = lock::acquire(self.backend.lock(), conn, public, self.retry.as_ref()).await?;
        self.log_state(public, MigrationState::LockAcquired);

        let session = MigrationSession::new(MigrationMode::Shared, public, Arc::clone(&self.backend));
        self.log_state(public, MigrationState::Migrating);
        let result = self.migrator.auto_migrate(Some(&session), conn, models).await;

        let released = guard.release(conn).await;
        result?;
        released?;
        Ok(session.run_id())
    }

    async fn tenant_steps(
        &self,
        conn: &mut dyn TenantConnection,
        tenant: &str,
        models: &[ModelRef],
    ) -> TenancyResult<Uuid> {
        conn.execute(&self.backend.create_namespace_sql(tenant)).await?;
        self.log_state(tenant, MigrationState::SchemaCreated);

        let guard = lock::acquire(self.backend.lock(), conn, tenant, self.retry.as_ref()).await?;
        self.log_state(tenant, MigrationState::LockAcquired);

        let result = self.migrate_in_tenant(conn, tenant, models).await;

        let released = guard.release(conn).await;
        let run_id = result?;
        released?;
        Ok(run_id)
    }

    /// Switch to the tenant, migrate, and switch back to public.
    async fn migrate_in_tenant(
        &self,
        conn: &mut dyn TenantConnection,
        tenant: &str,
        models: &[ModelRef],
    ) -> TenancyResult<Uuid> {
        conn.execute(&self.backend.use_namespace_sql(tenant)).await?;

        let session = MigrationSession::new(MigrationMode::Tenant, tenant, Arc::clone(&self.backend));
        self.log_state(tenant, MigrationState::Migrating);
        let result = self.migrator.auto_migrate(Some(&session), conn, models).await;

        let reset = conn
            .execute(&self.backend.use_namespace_sql(&self.public_schema))
            .await;
        result?;
        reset?;
        Ok(session.run_id())
    }

    async fn offboard_steps(&self, conn: &mut dyn TenantConnection, tenant: &str) -> TenancyResult<()> {
        let guard = lock::acquire(self.backend.lock(), conn, tenant, self.retry.as_ref()).await?;
        let result = conn.execute(&self.backend.drop_namespace_sql(tenant)).await;
        let released = guard.release(conn).await;
        result?;
        released
    }

    fn log_state(&self, namespace: &str, state: MigrationState) {
        debug!(
            backend = self.backend.name(),
            namespace,
            state = %state,
            "migration state"
        );
    }
}

/// Commit or roll back a transaction this module opened.
async fn finish_transaction<T>(
    conn: &mut dyn TenantConnection,
    owns_transaction: bool,
    result: TenancyResult<T>,
) -> TenancyResult<T> {
    if !owns_transaction {
        return result;
    }

    match result {
        Ok(value) => match conn.commit().await {
            Ok(()) => Ok(value),
            Err(e) => {
                if conn.in_transaction() {
                    if let Err(rollback) = conn.rollback().await {
                        log_warn!(error = %rollback, "rollback after failed commit failed");
                    }
                }
                Err(e)
            }
        },
        Err(error) => {
            if let Err(rollback) = conn.rollback().await {
                log_warn!(error = %rollback, "rollback failed");
            }
            Err(error)
        }
    }
}

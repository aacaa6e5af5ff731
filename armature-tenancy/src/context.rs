//! Tenant Context Switching
//!
//! Scopes a connection to one tenant by activating the tenant's namespace
//! (`SET search_path` on PostgreSQL, `USE` on MySQL) and switching back to
//! the public namespace afterwards.
//!
//! The active namespace is connection-local state. A connection must be
//! reset before it is reused for another tenant or returned to a pool, and a
//! single connection must never be shared by tasks serving different
//! tenants.
//!
//! # Usage
//!
//! ```rust,ignore
//! let reset = context.use_tenant(&mut conn, "acme").await?;
//! conn.execute("INSERT INTO books (title) VALUES ('Dune')").await?;
//! reset.reset(&mut conn).await?;
//!
//! // Or let the closure form reset for you
//! let count = context
//!     .with_tenant(&mut conn, "acme", |conn| {
//!         Box::pin(async move { conn.query_value("SELECT COUNT(*) FROM books", &[]).await })
//!     })
//!     .await?;
//! ```

use crate::backend::BackendOps;
use crate::connection::{ConnFuture, SqlValue, TenantConnection};
use crate::error::{TenancyError, TenancyResult};
use crate::logging::{debug, log_warn};
use crate::namespace;
use std::sync::Arc;

/// Switches connections between tenant namespaces and the public one.
#[derive(Debug, Clone)]
pub struct TenantContext {
    backend: Arc<dyn BackendOps>,
    public_schema: String,
}

impl TenantContext {
    /// Create a switcher for `backend`.
    pub fn new(backend: Arc<dyn BackendOps>, public_schema: impl Into<String>) -> Self {
        Self {
            backend,
            public_schema: public_schema.into(),
        }
    }

    /// Public namespace name.
    pub fn public_schema(&self) -> &str {
        &self.public_schema
    }

    /// Make `tenant` the connection's active namespace.
    ///
    /// The returned [`TenantReset`] must be used to switch back to the
    /// public namespace once the tenant's work is done.
    pub async fn use_tenant(
        &self,
        conn: &mut dyn TenantConnection,
        tenant: &str,
    ) -> TenancyResult<TenantReset> {
        namespace::validate(tenant)?;

        conn.execute(&self.backend.use_namespace_sql(tenant))
            .await
            .map_err(|e| e.context(self.backend.name(), "use tenant", tenant))?;

        debug!(backend = self.backend.name(), tenant, "switched to tenant");

        Ok(TenantReset {
            backend: self.backend.name(),
            tenant: tenant.to_string(),
            public_schema: self.public_schema.clone(),
            sql: self.backend.use_namespace_sql(&self.public_schema),
        })
    }

    /// Run `f` with the connection scoped to `tenant`.
    ///
    /// The connection is switched back to the public namespace whether or
    /// not `f` succeeds. When both `f` and the reset fail the result is
    /// [`TenancyError::ScopeAndReset`] carrying both errors.
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
        let reset = self.use_tenant(conn, tenant).await?;
        let result = f(&mut *conn).await;
        let reset_result = reset.reset(conn).await;

        match (result, reset_result) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(error), Ok(())) => Err(error),
            (Ok(_), Err(reset)) => Err(reset),
            (Err(error), Err(reset)) => Err(TenancyError::ScopeAndReset {
                error: Box::new(error),
                reset: Box::new(reset),
            }),
        }
    }

    /// The connection's active namespace, or the public namespace when none
    /// is active.
    pub async fn current_tenant(&self, conn: &mut dyn TenantConnection) -> TenancyResult<String> {
        let value = conn
            .query_value(self.backend.current_namespace_sql(), &[])
            .await
            .map_err(|e| e.context(self.backend.name(), "current tenant", &self.public_schema))?;

        match value {
            SqlValue::Null => Ok(self.public_schema.clone()),
            SqlValue::Text(name) if name.is_empty() => Ok(self.public_schema.clone()),
            SqlValue::Text(name) => Ok(name),
            other => Err(TenancyError::Database(format!(
                "unexpected result for `{}`: {other:?}",
                self.backend.current_namespace_sql()
            ))),
        }
    }

    /// Quoted `tenant.table` reference for statements that address a tenant
    /// table without switching the connection.
    pub fn qualified_table(&self, tenant: &str, table: &str) -> TenancyResult<String> {
        namespace::validate(tenant)?;
        if table.is_empty() || table.contains('.') {
            return Err(TenancyError::Config(format!(
                "`{table}` is not an unqualified table name"
            )));
        }

        Ok(format!(
            "{}.{}",
            self.backend.quote_identifier(tenant),
            self.backend.quote_identifier(table)
        ))
    }
}

/// Pending switch back to the public namespace.
#[must_use = "the connection stays scoped to the tenant until reset"]
#[derive(Debug)]
pub struct TenantReset {
    backend: &'static str,
    tenant: String,
    public_schema: String,
    sql: String,
}

impl TenantReset {
    /// Tenant the connection is scoped to.
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Re-activate the public namespace.
    pub async fn reset(self, conn: &mut dyn TenantConnection) -> TenancyResult<()> {
        match conn.execute(&self.sql).await {
            Ok(_) => {
                debug!(
                    backend = self.backend,
                    tenant = %self.tenant,
                    public = %self.public_schema,
                    "reset tenant context"
                );
                Ok(())
            }
            Err(e) => {
                log_warn!(backend = self.backend, tenant = %self.tenant, error = %e, "failed to reset tenant context");
                Err(e.context(self.backend, "reset tenant", self.tenant))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MySql, Postgres};
    use crate::testing::{Flavor, MockServer};

    fn pg() -> TenantContext {
        TenantContext::new(Arc::new(Postgres::new()), "public")
    }

    #[tokio::test]
    async fn test_use_tenant_and_reset() {
        let server = MockServer::new(Flavor::Postgres);
        server.create_namespace("acme");
        let mut conn = server.connect();
        let context = pg();

        let reset = context.use_tenant(&mut conn, "acme").await.unwrap();
        assert_eq!(reset.tenant(), "acme");
        assert_eq!(context.current_tenant(&mut conn).await.unwrap(), "acme");

        reset.reset(&mut conn).await.unwrap();
        assert_eq!(context.current_tenant(&mut conn).await.unwrap(), "public");
    }

    #[tokio::test]
    async fn test_use_tenant_validates_first() {
        let server = MockServer::new(Flavor::Postgres);
        let mut conn = server.connect();
        let context = pg();

        assert!(matches!(
            context.use_tenant(&mut conn, "").await,
            Err(TenancyError::InvalidTenant)
        ));
        assert!(matches!(
            context.use_tenant(&mut conn, "a\"; DROP SCHEMA public; --").await,
            Err(TenancyError::InvalidPattern(_))
        ));
        assert!(server.statements().is_empty());
    }

    #[tokio::test]
    async fn test_with_tenant_resets_after_error() {
        let server = MockServer::new(Flavor::Postgres);
        server.create_namespace("acme");
        let mut conn = server.connect();
        let context = pg();

        let err = context
            .with_tenant(&mut conn, "acme", |conn| {
                Box::pin(async move {
                    conn.execute("INSERT INTO missing (id) VALUES (1)").await?;
                    Ok(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TenancyError::Database(_)));
        assert_eq!(context.current_tenant(&mut conn).await.unwrap(), "public");
    }

    #[tokio::test]
    async fn test_with_tenant_joins_both_errors() {
        let server = MockServer::new(Flavor::Postgres);
        server.create_namespace("acme");
        let mut conn = server.connect();
        let context = pg();

        server.fail_on(r#"SET search_path TO "public""#, 1);
        let err = context
            .with_tenant(&mut conn, "acme", |_conn| {
                Box::pin(async move { Err::<(), _>(TenancyError::Database("boom".into())) })
            })
            .await
            .unwrap_err();

        match err {
            TenancyError::ScopeAndReset { error, reset } => {
                assert!(error.to_string().contains("boom"));
                assert!(reset.to_string().contains("reset tenant"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_with_tenant_returns_value() {
        let server = MockServer::new(Flavor::MySql);
        server.create_namespace("public");
        server.create_namespace("acme");
        let mut conn = server.connect();
        let context = TenantContext::new(Arc::new(MySql::new()), "public");

        let count = context
            .with_tenant(&mut conn, "acme", |conn| {
                Box::pin(async move {
                    conn.execute("CREATE TABLE IF NOT EXISTS `books` (id BIGINT)").await?;
                    conn.execute("INSERT INTO `books` (id) VALUES (1)").await?;
                    conn.query_value("SELECT COUNT(*) FROM `books`", &[]).await
                })
            })
            .await
            .unwrap();

        assert_eq!(count.as_i64(), Some(1));
        assert_eq!(context.current_tenant(&mut conn).await.unwrap(), "public");
        assert!(server.table_exists("acme", "books"));
    }

    #[tokio::test]
    async fn test_current_tenant_defaults_to_public() {
        let server = MockServer::new(Flavor::MySql);
        let mut conn = server.connect();
        let context = TenantContext::new(Arc::new(MySql::new()), "public");

        // No database selected yet.
        assert_eq!(context.current_tenant(&mut conn).await.unwrap(), "public");
    }

    #[test]
    fn test_qualified_table() {
        let context = pg();
        assert_eq!(
            context.qualified_table("acme", "books").unwrap(),
            r#""acme"."books""#
        );
        assert!(context.qualified_table("pg_acme", "books").is_err());
        assert!(context.qualified_table("acme", "public.books").is_err());

        let mysql = TenantContext::new(Arc::new(MySql::new()), "public");
        assert_eq!(mysql.qualified_table("acme", "books").unwrap(), "`acme`.`books`");
    }
}

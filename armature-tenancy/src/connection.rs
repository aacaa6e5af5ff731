//! SQL Execution Collaborator
//!
//! The engine never opens connections itself. Users implement
//! [`TenantConnection`] over whatever driver they already use (a single
//! checked-out connection or an open transaction, never a pool: namespace
//! switches are connection-local state).
//!
//! ```rust,ignore
//! struct PgConn(sqlx::PgConnection, bool);
//!
//! #[async_trait]
//! impl TenantConnection for PgConn {
//!     async fn execute(&mut self, sql: &str) -> TenancyResult<u64> {
//!         sqlx::raw_sql(sql)
//!             .execute(&mut self.0)
//!             .await
//!             .map(|r| r.rows_affected())
//!             .map_err(|e| TenancyError::Database(e.to_string()))
//!     }
//!     // ...
//! }
//! ```

use crate::error::TenancyResult;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;

/// Scalar value exchanged with the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Text.
    Text(String),
}

impl SqlValue {
    /// Interpret as a boolean. Integers are true when equal to 1.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            SqlValue::Int(i) => Some(*i == 1),
            _ => None,
        }
    }

    /// Interpret as an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(*i),
            SqlValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Interpret as text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Whether the value is `NULL`.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

/// Connection handle supplied by the SQL layer.
///
/// Placeholders in `query_value` follow the backend (`$1` for PostgreSQL,
/// `?` for MySQL); statements are built by the backend adapters, so
/// implementations only forward them.
#[async_trait]
pub trait TenantConnection: Send {
    /// Execute a statement, returning affected rows.
    async fn execute(&mut self, sql: &str) -> TenancyResult<u64>;

    /// Run a query returning a single scalar.
    async fn query_value(&mut self, sql: &str, params: &[SqlValue]) -> TenancyResult<SqlValue>;

    /// Begin a transaction.
    async fn begin(&mut self) -> TenancyResult<()>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> TenancyResult<()>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> TenancyResult<()>;

    /// Whether a transaction is open on this connection.
    fn in_transaction(&self) -> bool;
}

/// Future returned by closures that borrow a connection.
pub type ConnFuture<'c, T> = Pin<Box<dyn Future<Output = TenancyResult<T>> + Send + 'c>>;

//! Testing Utilities
//!
//! An in-memory stand-in for a PostgreSQL or MySQL server, good enough to
//! drive the lifecycle engine end to end without a database:
//!
//! - namespaces, tables and row counts shared by every connection;
//! - the statements the built-in backends emit, plus
//!   `CREATE TABLE IF NOT EXISTS`, `INSERT INTO` and `SELECT COUNT(*) FROM`;
//! - transactional DDL on the PostgreSQL flavor (rollback undoes schema and
//!   table creation and restores `search_path`); MySQL DDL is never undone;
//! - advisory locks shared across connections, released with the
//!   transaction (PostgreSQL) or on `RELEASE_LOCK` and disconnect (MySQL);
//! - failure injection by statement substring.
//!
//! # Example
//!
//! ```
//! use armature_tenancy::testing::{Flavor, MockServer};
//! use armature_tenancy::TenantConnection;
//!
//! # tokio_test::block_on(async {
//! let server = MockServer::new(Flavor::Postgres);
//! let mut conn = server.connect();
//!
//! conn.execute(r#"CREATE SCHEMA IF NOT EXISTS "acme""#).await.unwrap();
//! assert!(server.namespace_exists("acme"));
//! # });
//! ```

use crate::connection::{SqlValue, TenantConnection};
use crate::error::{TenancyError, TenancyResult};
use crate::migration::{MigrationSession, SchemaMigrator};
use crate::model::ModelRef;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// SQL dialect the mock speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// Schemas, `search_path`, transactional DDL, transaction-scoped locks.
    Postgres,
    /// Databases, `USE`, non-transactional DDL, named session locks.
    MySql,
}

impl Flavor {
    fn quote(self) -> char {
        match self {
            Flavor::Postgres => '"',
            Flavor::MySql => '`',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LockKey {
    Numeric(i64),
    Named(String),
}

#[derive(Debug)]
struct Failure {
    pattern: String,
    remaining: usize,
}

type Tables = BTreeMap<String, u64>;

#[derive(Debug, Default)]
struct Catalog {
    namespaces: BTreeMap<String, Tables>,
    locks: HashMap<LockKey, u64>,
    failures: Vec<Failure>,
    statements: Vec<String>,
    next_connection: u64,
}

impl Catalog {
    fn record(&mut self, sql: &str) -> TenancyResult<()> {
        self.statements.push(sql.to_string());

        let failure = self
            .failures
            .iter_mut()
            .find(|f| f.remaining > 0 && sql.contains(&f.pattern));
        if let Some(failure) = failure {
            failure.remaining -= 1;
            return Err(TenancyError::Database(format!("injected failure: {sql}")));
        }
        Ok(())
    }

    fn release_locks(&mut self, connection: u64, numeric_only: bool) {
        self.locks.retain(|key, owner| {
            *owner != connection || (numeric_only && matches!(key, LockKey::Named(_)))
        });
    }
}

/// Shared in-memory server. Clones refer to the same catalog.
#[derive(Debug, Clone)]
pub struct MockServer {
    flavor: Flavor,
    catalog: Arc<Mutex<Catalog>>,
}

impl MockServer {
    /// Start a server. The PostgreSQL flavor comes with a `public` schema;
    /// the MySQL flavor starts without databases.
    pub fn new(flavor: Flavor) -> Self {
        let mut catalog = Catalog::default();
        if flavor == Flavor::Postgres {
            catalog.namespaces.insert("public".to_string(), Tables::new());
        }

        Self {
            flavor,
            catalog: Arc::new(Mutex::new(catalog)),
        }
    }

    /// Dialect.
    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// Open a connection.
    pub fn connect(&self) -> MockConnection {
        let id = {
            let mut catalog = self.catalog.lock();
            catalog.next_connection += 1;
            catalog.next_connection
        };

        MockConnection {
            id,
            flavor: self.flavor,
            catalog: Arc::clone(&self.catalog),
            current: match self.flavor {
                Flavor::Postgres => Some("public".to_string()),
                Flavor::MySql => None,
            },
            transaction: None,
        }
    }

    /// Create a namespace outside any transaction.
    pub fn create_namespace(&self, name: &str) {
        self.catalog
            .lock()
            .namespaces
            .entry(name.to_string())
            .or_default();
    }

    /// Fail the next `times` statements containing `pattern`.
    pub fn fail_on(&self, pattern: &str, times: usize) {
        self.catalog.lock().failures.push(Failure {
            pattern: pattern.to_string(),
            remaining: times,
        });
    }

    /// Every statement received so far, including `BEGIN`/`COMMIT`/`ROLLBACK`.
    pub fn statements(&self) -> Vec<String> {
        self.catalog.lock().statements.clone()
    }

    /// Number of statements containing `needle`.
    pub fn count_statements(&self, needle: &str) -> usize {
        self.catalog
            .lock()
            .statements
            .iter()
            .filter(|s| s.contains(needle))
            .count()
    }

    /// Forget the statement log.
    pub fn clear_statements(&self) {
        self.catalog.lock().statements.clear();
    }

    /// Whether `namespace` exists.
    pub fn namespace_exists(&self, namespace: &str) -> bool {
        self.catalog.lock().namespaces.contains_key(namespace)
    }

    /// Whether `namespace` holds `table`.
    pub fn table_exists(&self, namespace: &str, table: &str) -> bool {
        self.row_count(namespace, table).is_some()
    }

    /// Rows inserted into `namespace.table`, if the table exists.
    pub fn row_count(&self, namespace: &str, table: &str) -> Option<u64> {
        self.catalog
            .lock()
            .namespaces
            .get(namespace)
            .and_then(|tables| tables.get(table).copied())
    }

    /// Advisory locks currently held by any connection.
    pub fn held_locks(&self) -> usize {
        self.catalog.lock().locks.len()
    }
}

#[derive(Debug)]
enum Undo {
    CreatedNamespace(String),
    DroppedNamespace(String, Tables),
    CreatedTable(String, String),
    Inserted(String, String),
}

#[derive(Debug)]
struct Transaction {
    undo: Vec<Undo>,
    saved_namespace: Option<String>,
}

/// Connection to a [`MockServer`].
///
/// Dropping the connection releases every lock it holds.
#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    flavor: Flavor,
    catalog: Arc<Mutex<Catalog>>,
    current: Option<String>,
    transaction: Option<Transaction>,
}

impl MockConnection {
    /// Connection identifier, unique per server.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The `search_path` schema or selected database.
    pub fn current_namespace(&self) -> Option<String> {
        self.current.clone()
    }

    fn record_undo(&mut self, undo: Undo) {
        let transactional = self.flavor == Flavor::Postgres || matches!(undo, Undo::Inserted(..));
        if let Some(tx) = self.transaction.as_mut() {
            if transactional {
                tx.undo.push(undo);
            }
        }
    }

    fn run(&mut self, sql: &str) -> TenancyResult<u64> {
        let sql = sql.trim();
        let quote = self.flavor.quote();
        self.catalog.lock().record(sql)?;

        let (create_ns, drop_ns, use_ns) = match self.flavor {
            Flavor::Postgres => ("CREATE SCHEMA IF NOT EXISTS ", "DROP SCHEMA IF EXISTS ", "SET search_path TO "),
            Flavor::MySql => ("CREATE DATABASE IF NOT EXISTS ", "DROP DATABASE IF EXISTS ", "USE "),
        };

        if let Some(rest) = sql.strip_prefix(create_ns) {
            let name = single_name(rest, quote)?;
            let created = {
                let mut catalog = self.catalog.lock();
                if catalog.namespaces.contains_key(&name) {
                    false
                } else {
                    catalog.namespaces.insert(name.clone(), Tables::new());
                    true
                }
            };
            if created {
                self.record_undo(Undo::CreatedNamespace(name));
            }
            return Ok(0);
        }

        if let Some(rest) = sql.strip_prefix(drop_ns) {
            let name = single_name(rest, quote)?;
            let dropped = self.catalog.lock().namespaces.remove(&name);
            if let Some(tables) = dropped {
                if self.flavor == Flavor::MySql && self.current.as_deref() == Some(name.as_str()) {
                    self.current = None;
                }
                self.record_undo(Undo::DroppedNamespace(name, tables));
            }
            return Ok(0);
        }

        if let Some(rest) = sql.strip_prefix(use_ns) {
            let name = single_name(rest, quote)?;
            if self.flavor == Flavor::MySql && !self.catalog.lock().namespaces.contains_key(&name) {
                return Err(TenancyError::Database(format!("Unknown database '{name}'")));
            }
            self.current = Some(name);
            return Ok(0);
        }

        if let Some(rest) = sql.strip_prefix("CREATE TABLE IF NOT EXISTS ") {
            let (namespace, table) = self.resolve_table(rest)?;
            let created = {
                let mut catalog = self.catalog.lock();
                let tables = catalog.namespaces.get_mut(&namespace).ok_or_else(|| {
                    TenancyError::Database(format!("namespace \"{namespace}\" does not exist"))
                })?;
                if tables.contains_key(&table) {
                    false
                } else {
                    tables.insert(table.clone(), 0);
                    true
                }
            };
            if created {
                self.record_undo(Undo::CreatedTable(namespace, table));
            }
            return Ok(0);
        }

        if let Some(rest) = sql.strip_prefix("INSERT INTO ") {
            let (namespace, table) = self.resolve_table(rest)?;
            {
                let mut catalog = self.catalog.lock();
                let rows = catalog
                    .namespaces
                    .get_mut(&namespace)
                    .and_then(|tables| tables.get_mut(&table))
                    .ok_or_else(|| {
                        TenancyError::Database(format!("relation \"{namespace}.{table}\" does not exist"))
                    })?;
                *rows += 1;
            }
            self.record_undo(Undo::Inserted(namespace, table));
            return Ok(1);
        }

        Err(TenancyError::Database(format!("unsupported statement: {sql}")))
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> TenancyResult<SqlValue> {
        let sql = sql.trim();
        self.catalog.lock().record(sql)?;

        match (self.flavor, sql) {
            (Flavor::Postgres, "SELECT pg_try_advisory_xact_lock($1)") => {
                let key = params.first().and_then(SqlValue::as_i64).ok_or_else(|| {
                    TenancyError::Database("pg_try_advisory_xact_lock expects a bigint".into())
                })?;
                let key = LockKey::Numeric(key);
                let mut catalog = self.catalog.lock();
                match catalog.locks.get(&key).copied() {
                    Some(owner) if owner != self.id => Ok(SqlValue::Bool(false)),
                    _ => {
                        // Outside a transaction the lock ends with the statement.
                        if self.transaction.is_some() {
                            catalog.locks.insert(key, self.id);
                        }
                        Ok(SqlValue::Bool(true))
                    }
                }
            }
            (Flavor::Postgres, "SELECT current_schema()") | (Flavor::MySql, "SELECT DATABASE()") => {
                let catalog = self.catalog.lock();
                Ok(match &self.current {
                    Some(name) if catalog.namespaces.contains_key(name) => SqlValue::Text(name.clone()),
                    _ => SqlValue::Null,
                })
            }
            (Flavor::MySql, "SELECT GET_LOCK(?, ?)") => {
                let key = LockKey::Named(text_param(params)?);
                let mut catalog = self.catalog.lock();
                match catalog.locks.get(&key).copied() {
                    Some(owner) if owner != self.id => Ok(SqlValue::Int(0)),
                    _ => {
                        catalog.locks.insert(key, self.id);
                        Ok(SqlValue::Int(1))
                    }
                }
            }
            (Flavor::MySql, "SELECT RELEASE_LOCK(?)") => {
                let key = LockKey::Named(text_param(params)?);
                let mut catalog = self.catalog.lock();
                match catalog.locks.get(&key).copied() {
                    Some(owner) if owner == self.id => {
                        catalog.locks.remove(&key);
                        Ok(SqlValue::Int(1))
                    }
                    Some(_) => Ok(SqlValue::Int(0)),
                    None => Ok(SqlValue::Null),
                }
            }
            (_, sql) => match sql.strip_prefix("SELECT COUNT(*) FROM ") {
                Some(rest) => {
                    let (namespace, table) = self.resolve_table(rest)?;
                    self.catalog
                        .lock()
                        .namespaces
                        .get(&namespace)
                        .and_then(|tables| tables.get(&table))
                        .map(|rows| SqlValue::Int(*rows as i64))
                        .ok_or_else(|| {
                            TenancyError::Database(format!(
                                "relation \"{namespace}.{table}\" does not exist"
                            ))
                        })
                }
                None => Err(TenancyError::Database(format!("unsupported query: {sql}"))),
            },
        }
    }

    fn resolve_table(&self, input: &str) -> TenancyResult<(String, String)> {
        let (mut parts, _) = take_name(input, self.flavor.quote())
            .ok_or_else(|| TenancyError::Database(format!("syntax error near `{input}`")))?;

        match parts.len() {
            1 => {
                let namespace = self.current.clone().ok_or_else(|| {
                    TenancyError::Database("no namespace has been selected".into())
                })?;
                Ok((namespace, parts.remove(0)))
            }
            2 => {
                let table = parts.remove(1);
                Ok((parts.remove(0), table))
            }
            _ => Err(TenancyError::Database(format!("invalid table reference `{input}`"))),
        }
    }

    fn end_transaction(&mut self, commit: bool) -> TenancyResult<()> {
        let sql = if commit { "COMMIT" } else { "ROLLBACK" };
        self.catalog.lock().record(sql)?;

        let tx = self
            .transaction
            .take()
            .ok_or_else(|| TenancyError::Database("no transaction in progress".into()))?;

        let mut catalog = self.catalog.lock();
        if !commit {
            for undo in tx.undo.into_iter().rev() {
                match undo {
                    Undo::CreatedNamespace(name) => {
                        catalog.namespaces.remove(&name);
                    }
                    Undo::DroppedNamespace(name, tables) => {
                        catalog.namespaces.insert(name, tables);
                    }
                    Undo::CreatedTable(namespace, table) => {
                        if let Some(tables) = catalog.namespaces.get_mut(&namespace) {
                            tables.remove(&table);
                        }
                    }
                    Undo::Inserted(namespace, table) => {
                        if let Some(rows) = catalog
                            .namespaces
                            .get_mut(&namespace)
                            .and_then(|tables| tables.get_mut(&table))
                        {
                            *rows = rows.saturating_sub(1);
                        }
                    }
                }
            }
            if self.flavor == Flavor::Postgres {
                self.current = tx.saved_namespace;
            }
        }
        catalog.release_locks(self.id, true);
        Ok(())
    }
}

#[async_trait]
impl TenantConnection for MockConnection {
    async fn execute(&mut self, sql: &str) -> TenancyResult<u64> {
        self.run(sql)
    }

    async fn query_value(&mut self, sql: &str, params: &[SqlValue]) -> TenancyResult<SqlValue> {
        self.query(sql, params)
    }

    async fn begin(&mut self) -> TenancyResult<()> {
        self.catalog.lock().record("BEGIN")?;
        if self.transaction.is_some() {
            return Err(TenancyError::Database(
                "there is already a transaction in progress".into(),
            ));
        }
        self.transaction = Some(Transaction {
            undo: Vec::new(),
            saved_namespace: self.current.clone(),
        });
        Ok(())
    }

    async fn commit(&mut self) -> TenancyResult<()> {
        self.end_transaction(true)
    }

    async fn rollback(&mut self) -> TenancyResult<()> {
        self.end_transaction(false)
    }

    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.catalog.lock().release_locks(self.id, false);
    }
}

fn text_param(params: &[SqlValue]) -> TenancyResult<String> {
    params
        .first()
        .and_then(SqlValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| TenancyError::Database("expected a string lock name".into()))
}

fn single_name(input: &str, quote: char) -> TenancyResult<String> {
    match take_name(input, quote) {
        Some((mut parts, _)) if parts.len() == 1 => Ok(parts.remove(0)),
        _ => Err(TenancyError::Database(format!("invalid identifier `{input}`"))),
    }
}

/// Read a possibly quoted, possibly dotted name from the start of `input`.
fn take_name(input: &str, quote: char) -> Option<(Vec<String>, &str)> {
    let mut parts = Vec::new();
    let mut rest = input.trim_start();

    loop {
        let (part, after) = match rest.strip_prefix(quote) {
            Some(body) => {
                let mut part = String::new();
                let mut chars = body.char_indices().peekable();
                let mut end = None;
                while let Some((i, c)) = chars.next() {
                    if c != quote {
                        part.push(c);
                    } else if matches!(chars.peek(), Some((_, next)) if *next == quote) {
                        part.push(quote);
                        chars.next();
                    } else {
                        end = Some(i + c.len_utf8());
                        break;
                    }
                }
                (part, &body[end?..])
            }
            None => {
                let end = rest
                    .find(|c: char| !(c.is_alphanumeric() || c == '_'))
                    .unwrap_or(rest.len());
                if end == 0 {
                    return None;
                }
                (rest[..end].to_string(), &rest[end..])
            }
        };

        parts.push(part);
        match after.strip_prefix('.') {
            Some(next) => rest = next,
            None => return Some((parts, after)),
        }
    }
}

/// Records concurrent runs for one namespace.
#[derive(Debug, Default)]
struct Activity {
    active: usize,
    peak: usize,
}

/// [`SchemaMigrator`] that creates one table per model.
///
/// Tracks how many runs overlap per namespace so tests can check that the
/// advisory lock serializes same-tenant migrations.
#[derive(Debug, Default)]
pub struct TableMigrator {
    pause: Duration,
    runs: Mutex<usize>,
    activity: Mutex<HashMap<String, Activity>>,
}

impl TableMigrator {
    /// Create a migrator without pause.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `pause` inside every run, widening race windows.
    pub fn with_pause(pause: Duration) -> Self {
        Self {
            pause,
            ..Self::default()
        }
    }

    /// Completed or in-flight runs.
    pub fn runs(&self) -> usize {
        *self.runs.lock()
    }

    /// Highest number of simultaneous runs seen for `namespace`.
    pub fn max_concurrency(&self, namespace: &str) -> usize {
        self.activity
            .lock()
            .get(namespace)
            .map_or(0, |activity| activity.peak)
    }

    fn enter(&self, namespace: &str) {
        *self.runs.lock() += 1;
        let mut activity = self.activity.lock();
        let entry = activity.entry(namespace.to_string()).or_default();
        entry.active += 1;
        entry.peak = entry.peak.max(entry.active);
    }

    fn exit(&self, namespace: &str) {
        if let Some(entry) = self.activity.lock().get_mut(namespace) {
            entry.active = entry.active.saturating_sub(1);
        }
    }
}

#[async_trait]
impl SchemaMigrator for TableMigrator {
    async fn migrate(
        &self,
        session: &MigrationSession,
        conn: &mut dyn TenantConnection,
        models: &[ModelRef],
    ) -> TenancyResult<()> {
        self.enter(session.namespace());
        if !self.pause.is_zero() {
            tokio::time::sleep(self.pause).await;
        }

        let mut result = Ok(());
        for model in models {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} (id BIGINT PRIMARY KEY)",
                session.backend().quote_table(&model.table_name())
            );
            if let Err(e) = conn.execute(&sql).await {
                result = Err(e);
                break;
            }
        }

        self.exit(session.namespace());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::lock_key_hash;

    #[test]
    fn test_take_name() {
        let (parts, rest) = take_name(r#""public"."te""nants" (id)"#, '"').unwrap();
        assert_eq!(parts, ["public", "te\"nants"]);
        assert_eq!(rest, " (id)");

        let (parts, _) = take_name("books", '`').unwrap();
        assert_eq!(parts, ["books"]);

        assert!(take_name("(oops", '"').is_none());
        assert!(take_name("\"unterminated", '"').is_none());
    }

    #[tokio::test]
    async fn test_postgres_rollback_undoes_ddl() {
        let server = MockServer::new(Flavor::Postgres);
        let mut conn = server.connect();

        conn.begin().await.unwrap();
        conn.execute(r#"CREATE SCHEMA IF NOT EXISTS "acme""#).await.unwrap();
        conn.execute(r#"SET search_path TO "acme""#).await.unwrap();
        conn.execute(r#"CREATE TABLE IF NOT EXISTS "books" (id BIGINT)"#)
            .await
            .unwrap();
        assert!(server.table_exists("acme", "books"));

        conn.rollback().await.unwrap();
        assert!(!server.namespace_exists("acme"));
        assert_eq!(conn.current_namespace().as_deref(), Some("public"));
    }

    #[tokio::test]
    async fn test_mysql_ddl_survives_rollback() {
        let server = MockServer::new(Flavor::MySql);
        let mut conn = server.connect();

        conn.begin().await.unwrap();
        conn.execute("CREATE DATABASE IF NOT EXISTS `acme`").await.unwrap();
        conn.execute("USE `acme`").await.unwrap();
        conn.execute("CREATE TABLE IF NOT EXISTS `books` (id BIGINT)")
            .await
            .unwrap();
        conn.execute("INSERT INTO `books` (id) VALUES (1)").await.unwrap();
        conn.rollback().await.unwrap();

        assert!(server.table_exists("acme", "books"));
        assert_eq!(server.row_count("acme", "books"), Some(0));
    }

    #[tokio::test]
    async fn test_mysql_use_unknown_database() {
        let server = MockServer::new(Flavor::MySql);
        let mut conn = server.connect();

        let err = conn.execute("USE `nope`").await.unwrap_err();
        assert!(err.to_string().contains("Unknown database"));
    }

    #[tokio::test]
    async fn test_locks_released_on_drop() {
        let server = MockServer::new(Flavor::MySql);
        let mut conn = server.connect();

        let granted = conn
            .query_value("SELECT GET_LOCK(?, ?)", &[SqlValue::from("acme"), SqlValue::Int(0)])
            .await
            .unwrap();
        assert_eq!(granted.as_i64(), Some(1));
        assert_eq!(server.held_locks(), 1);

        drop(conn);
        assert_eq!(server.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_pg_xact_lock_released_on_commit() {
        let server = MockServer::new(Flavor::Postgres);
        let mut a = server.connect();
        let mut b = server.connect();
        let key = [SqlValue::Int(lock_key_hash("acme"))];

        a.begin().await.unwrap();
        let granted = a
            .query_value("SELECT pg_try_advisory_xact_lock($1)", &key)
            .await
            .unwrap();
        assert_eq!(granted, SqlValue::Bool(true));

        let denied = b
            .query_value("SELECT pg_try_advisory_xact_lock($1)", &key)
            .await
            .unwrap();
        assert_eq!(denied, SqlValue::Bool(false));

        a.commit().await.unwrap();
        assert_eq!(server.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_failure_injection_counts_down() {
        let server = MockServer::new(Flavor::Postgres);
        let mut conn = server.connect();
        server.fail_on("CREATE SCHEMA", 1);

        assert!(conn.execute(r#"CREATE SCHEMA IF NOT EXISTS "acme""#).await.is_err());
        assert!(conn.execute(r#"CREATE SCHEMA IF NOT EXISTS "acme""#).await.is_ok());
        assert_eq!(server.count_statements("CREATE SCHEMA"), 2);
    }

    #[tokio::test]
    async fn test_count_rows() {
        let server = MockServer::new(Flavor::Postgres);
        let mut conn = server.connect();

        conn.execute(r#"CREATE TABLE IF NOT EXISTS "public"."tenants" (id BIGINT)"#)
            .await
            .unwrap();
        conn.execute(r#"INSERT INTO "public"."tenants" (id) VALUES (1)"#)
            .await
            .unwrap();

        let count = conn
            .query_value(r#"SELECT COUNT(*) FROM "tenants""#, &[])
            .await
            .unwrap();
        assert_eq!(count, SqlValue::Int(1));
    }
}

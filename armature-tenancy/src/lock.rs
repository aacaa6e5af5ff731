//! Advisory locks backed by the database engine.
//!
//! Migrations for the same namespace are serialized with an engine-native
//! lock keyed by the namespace name; different namespaces never contend.
//!
//! - PostgreSQL: `pg_try_advisory_xact_lock(bigint)`, transaction scoped, the
//!   string key is hashed with [`lock_key_hash`].
//! - MySQL: `GET_LOCK(name, 0)` / `RELEASE_LOCK(name)`, connection scoped, the
//!   string key is used as is and must be released on the same connection.

use crate::connection::{SqlValue, TenantConnection};
use crate::error::{TenancyError, TenancyResult};
use crate::logging::{debug, log_warn};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::fmt;

/// FNV-1a 64-bit offset basis.
pub const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;

/// FNV-1a 64-bit prime.
pub const FNV_PRIME: u64 = 0x100000001b3;

/// Map a lock key to the numeric key PostgreSQL advisory locks take.
///
/// FNV-1a over the UTF-8 bytes of `key`, reinterpreted as a signed 64-bit
/// integer. Every process contending for the same namespace must derive the
/// same number, so this function must never change.
///
/// ```
/// use armature_tenancy::lock::lock_key_hash;
///
/// assert_eq!(lock_key_hash(""), 0xcbf29ce484222325_u64 as i64);
/// assert_eq!(lock_key_hash("a"), 0xaf63dc4c8601ec8c_u64 as i64);
/// ```
pub fn lock_key_hash(key: &str) -> i64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash as i64
}

/// How long a granted lock lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    /// Released by the engine when the transaction ends.
    Transaction,
    /// Held until released explicitly or the connection closes.
    Session,
}

/// Engine-native try-lock primitive.
#[async_trait]
pub trait AdvisoryLock: Send + Sync + fmt::Debug {
    /// Lifetime of a granted lock.
    fn scope(&self) -> LockScope;

    /// Try to take the lock once without waiting.
    async fn try_lock(&self, conn: &mut dyn TenantConnection, key: &str) -> TenancyResult<bool>;

    /// Release the lock. A no-op for transaction-scoped locks.
    async fn unlock(&self, conn: &mut dyn TenantConnection, key: &str) -> TenancyResult<()>;
}

/// PostgreSQL transaction-scoped advisory lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgAdvisoryXactLock;

#[async_trait]
impl AdvisoryLock for PgAdvisoryXactLock {
    fn scope(&self) -> LockScope {
        LockScope::Transaction
    }

    async fn try_lock(&self, conn: &mut dyn TenantConnection, key: &str) -> TenancyResult<bool> {
        // Outside a transaction the lock would be dropped as soon as the
        // statement finishes.
        if !conn.in_transaction() {
            return Err(TenancyError::TransactionRequired(
                "pg_try_advisory_xact_lock",
            ));
        }

        let value = conn
            .query_value(
                "SELECT pg_try_advisory_xact_lock($1)",
                &[SqlValue::Int(lock_key_hash(key))],
            )
            .await?;

        value.as_bool().ok_or_else(|| {
            TenancyError::Database(format!(
                "unexpected pg_try_advisory_xact_lock result: {value:?}"
            ))
        })
    }

    async fn unlock(&self, _conn: &mut dyn TenantConnection, _key: &str) -> TenancyResult<()> {
        Ok(())
    }
}

/// MySQL named lock (`GET_LOCK` / `RELEASE_LOCK`).
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlNamedLock {
    /// Seconds `GET_LOCK` waits inside the server. Zero means try once.
    pub wait_secs: u32,
}

#[async_trait]
impl AdvisoryLock for MySqlNamedLock {
    fn scope(&self) -> LockScope {
        LockScope::Session
    }

    async fn try_lock(&self, conn: &mut dyn TenantConnection, key: &str) -> TenancyResult<bool> {
        let value = conn
            .query_value(
                "SELECT GET_LOCK(?, ?)",
                &[SqlValue::from(key), SqlValue::Int(i64::from(self.wait_secs))],
            )
            .await?;

        match value.as_i64() {
            Some(1) => Ok(true),
            Some(0) => Ok(false),
            _ => Err(TenancyError::Database(format!(
                "GET_LOCK(`{key}`) returned {value:?}"
            ))),
        }
    }

    async fn unlock(&self, conn: &mut dyn TenantConnection, key: &str) -> TenancyResult<()> {
        let value = conn
            .query_value("SELECT RELEASE_LOCK(?)", &[SqlValue::from(key)])
            .await?;

        // 0: held by another session, NULL: no such lock.
        if value.as_i64() == Some(1) {
            Ok(())
        } else {
            Err(TenancyError::ReleaseLockFailed(key.to_string()))
        }
    }
}

/// A granted lock. Call [`LockHandle::release`] on the connection that
/// acquired it.
#[must_use = "a session-scoped lock stays held until released"]
#[derive(Debug)]
pub struct LockHandle<'l> {
    lock: &'l dyn AdvisoryLock,
    key: String,
}

impl LockHandle<'_> {
    /// The lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock.
    pub async fn release(self, conn: &mut dyn TenantConnection) -> TenancyResult<()> {
        match self.lock.unlock(conn, &self.key).await {
            Ok(()) => {
                debug!(key = %self.key, "released advisory lock");
                Ok(())
            }
            Err(e) => {
                log_warn!(key = %self.key, error = %e, "failed to release advisory lock");
                Err(e)
            }
        }
    }
}

/// Take `key`, retrying with backoff when `retry` is given.
///
/// Without a policy a single failed try fails immediately. Either way the
/// error is [`TenancyError::AcquireLockFailed`] wrapping the last failure.
pub async fn acquire<'l>(
    lock: &'l dyn AdvisoryLock,
    conn: &mut dyn TenantConnection,
    key: &str,
    retry: Option<&RetryPolicy>,
) -> TenancyResult<LockHandle<'l>> {
    let mut backoff = retry.map(|policy| policy.backoff("acquire lock"));

    loop {
        let error = match lock.try_lock(conn, key).await {
            Ok(true) => {
                debug!(key, "acquired advisory lock");
                return Ok(LockHandle {
                    lock,
                    key: key.to_string(),
                });
            }
            Ok(false) => TenancyError::LockNotAcquired(key.to_string()),
            Err(e) => e,
        };

        if error.is_retryable() {
            if let Some(backoff) = backoff.as_mut() {
                if backoff.wait(&error).await {
                    continue;
                }
            }
        }

        return Err(TenancyError::AcquireLockFailed {
            key: key.to_string(),
            attempts: backoff.as_ref().map_or(1, |b| b.attempts()),
            source: Box::new(error),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Flavor, MockServer};
    use std::time::Duration;

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(lock_key_hash(""), FNV_OFFSET_BASIS as i64);
        assert_eq!(lock_key_hash("a"), 0xaf63dc4c8601ec8c_u64 as i64);
        assert_eq!(lock_key_hash("foobar"), 0x85944171f73967e8_u64 as i64);
    }

    #[test]
    fn test_distinct_keys_distinct_hashes() {
        assert_ne!(lock_key_hash("tenant1"), lock_key_hash("tenant2"));
        assert_eq!(lock_key_hash("public"), lock_key_hash("public"));
    }

    #[tokio::test]
    async fn test_pg_lock_requires_transaction() {
        let server = MockServer::new(Flavor::Postgres);
        let mut conn = server.connect();

        let err = PgAdvisoryXactLock.try_lock(&mut conn, "acme").await.unwrap_err();
        assert!(matches!(err, TenancyError::TransactionRequired(_)));
    }

    #[tokio::test]
    async fn test_pg_lock_is_exclusive_until_transaction_end() {
        let server = MockServer::new(Flavor::Postgres);
        let mut a = server.connect();
        let mut b = server.connect();
        a.begin().await.unwrap();
        b.begin().await.unwrap();

        let handle = acquire(&PgAdvisoryXactLock, &mut a, "acme", None).await.unwrap();
        let err = acquire(&PgAdvisoryXactLock, &mut b, "acme", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TenancyError::AcquireLockFailed { attempts: 1, .. }
        ));

        // A different tenant does not contend.
        let other = acquire(&PgAdvisoryXactLock, &mut b, "globex", None).await.unwrap();

        handle.release(&mut a).await.unwrap();
        assert!(!PgAdvisoryXactLock.try_lock(&mut b, "acme").await.unwrap());

        a.commit().await.unwrap();
        assert!(PgAdvisoryXactLock.try_lock(&mut b, "acme").await.unwrap());

        other.release(&mut b).await.unwrap();
        b.commit().await.unwrap();
        assert_eq!(server.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_mysql_lock_release_on_same_connection() {
        let server = MockServer::new(Flavor::MySql);
        let mut a = server.connect();
        let mut b = server.connect();
        let lock = MySqlNamedLock::default();

        let handle = acquire(&lock, &mut a, "acme", None).await.unwrap();
        assert!(!lock.try_lock(&mut b, "acme").await.unwrap());

        let err = lock.unlock(&mut b, "acme").await.unwrap_err();
        assert!(matches!(err, TenancyError::ReleaseLockFailed(_)));

        handle.release(&mut a).await.unwrap();
        assert!(lock.try_lock(&mut b, "acme").await.unwrap());

        let err = lock.unlock(&mut a, "missing").await.unwrap_err();
        assert!(matches!(err, TenancyError::ReleaseLockFailed(_)));
    }

    #[tokio::test]
    async fn test_acquire_retries_until_released() {
        let server = MockServer::new(Flavor::MySql);
        let mut holder = server.connect();
        let mut waiter = server.connect();
        let lock = MySqlNamedLock::default();

        let handle = acquire(&lock, &mut holder, "acme", None).await.unwrap();

        let waiting = tokio::spawn(async move {
            let lock = MySqlNamedLock::default();
            let policy = RetryPolicy::new(10, Duration::from_millis(5), Duration::from_millis(20));
            acquire(&lock, &mut waiter, "acme", Some(&policy))
                .await
                .map(|granted| granted.key().to_string())
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.release(&mut holder).await.unwrap();

        assert_eq!(waiting.await.unwrap().unwrap(), "acme");
    }

    #[tokio::test]
    async fn test_acquire_exhausts_retries() {
        let server = MockServer::new(Flavor::MySql);
        let mut holder = server.connect();
        let mut waiter = server.connect();
        let lock = MySqlNamedLock::default();

        let _held = acquire(&lock, &mut holder, "acme", None).await.unwrap();

        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2));
        let err = acquire(&lock, &mut waiter, "acme", Some(&policy))
            .await
            .unwrap_err();

        match err {
            TenancyError::AcquireLockFailed {
                key,
                attempts,
                source,
            } => {
                assert_eq!(key, "acme");
                assert_eq!(attempts, 3);
                assert!(matches!(*source, TenancyError::LockNotAcquired(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_errors_fail_fast() {
        let server = MockServer::new(Flavor::Postgres);
        let mut conn = server.connect();

        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(1));
        let err = acquire(&PgAdvisoryXactLock, &mut conn, "acme", Some(&policy))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TenancyError::AcquireLockFailed { attempts: 1, .. }
        ));
    }
}

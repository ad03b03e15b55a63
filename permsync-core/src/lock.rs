//! Redis-backed distributed locks (spec.md §5 "Locks"): `beat_lock`, the
//! function-scoped `try_generate_permissions_sync_tasks` lock, and the
//! per-CCP `permissions_sync_lock:<ccp_id>`.
//!
//! Grounded in `examples/other_examples/..._cache.rs.rs`'s `LockGuard`:
//! NX/PX acquire, a per-acquisition random token so only the holder can
//! release or extend, and a Lua script for atomic compare-and-delete /
//! compare-and-extend.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::Result;
use crate::fence::make_short_id;

/// Prefix all function-scoped locks live under (spec.md §6
/// "Function locks under `DANSWER_REDIS_FUNCTION_LOCK_PREFIX`").
pub const FUNCTION_LOCK_PREFIX: &str = "da_function_lock:";

/// Name of the singleton beat-tick lock (spec.md §5).
pub const BEAT_LOCK_NAME: &str = "beat_lock";

/// Name of the fence-creation serialization lock (spec.md §4.1, §4.2.2,
/// §5; Open Question #3 — deliberately process-global, not per-CCP).
pub const FENCE_CREATE_LOCK_NAME: &str = "try_generate_permissions_sync_tasks";

fn per_ccp_sync_lock_name(ccp_id: i64) -> String {
    format!("permissions_sync_lock:{ccp_id}")
}

/// A held lock, released (or extended) only by its holder via `token`.
#[derive(Clone)]
pub struct LockGuard {
    key: String,
    token: String,
}

impl LockGuard {
    /// Construct a guard directly, for `DistributedLock` implementations
    /// outside this module (fakes in other modules' test suites).
    pub fn for_test(key: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: token.into(),
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }
}

/// The distributed-lock primitive used throughout the Beat Scheduler and
/// Generator Worker (spec.md §5). All locks are Redis `SET NX PX` keys
/// released by a Lua compare-and-delete so a lock can never be released or
/// extended by a process that doesn't hold it.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Attempt to acquire `name` with a given TTL, non-blocking. Returns
    /// `None` immediately if already held (spec.md §4.2 step 1 "`beat_lock`
    /// ... non-blocking").
    async fn try_acquire(&self, name: &str, ttl_ms: u64) -> Result<Option<LockGuard>>;

    /// Attempt to acquire `name`, retrying at a fixed interval until
    /// `timeout_ms` elapses (spec.md §4.2.2, §4.3 step 2 — blocking
    /// acquires with a bounded timeout).
    async fn acquire_blocking(
        &self,
        name: &str,
        ttl_ms: u64,
        timeout_ms: u64,
    ) -> Result<Option<LockGuard>>;

    /// Re-extend a held lock's TTL. Fails (returns `Ok(false)`) if the
    /// guard's token no longer matches what's stored (lock was lost).
    async fn extend(&self, guard: &LockGuard, ttl_ms: u64) -> Result<bool>;

    /// Release a held lock. A no-op if the token no longer matches.
    async fn release(&self, guard: &LockGuard) -> Result<()>;
}

/// Redis implementation of `DistributedLock`.
#[derive(Clone)]
pub struct RedisDistributedLock {
    conn: ConnectionManager,
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

impl RedisDistributedLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn try_once(&self, name: &str, ttl_ms: u64) -> Result<Option<LockGuard>> {
        let mut conn = self.conn();
        let token = make_short_id();
        let acquired: bool = redis::cmd("SET")
            .arg(name)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<_, Option<String>>(&mut conn)
            .await?
            .is_some();
        if acquired {
            Ok(Some(LockGuard {
                key: name.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl DistributedLock for RedisDistributedLock {
    async fn try_acquire(&self, name: &str, ttl_ms: u64) -> Result<Option<LockGuard>> {
        self.try_once(name, ttl_ms).await
    }

    async fn acquire_blocking(
        &self,
        name: &str,
        ttl_ms: u64,
        timeout_ms: u64,
    ) -> Result<Option<LockGuard>> {
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_millis(timeout_ms);
        loop {
            if let Some(guard) = self.try_once(name, ttl_ms).await? {
                return Ok(Some(guard));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }
    }

    async fn extend(&self, guard: &LockGuard, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.conn();
        let script = redis::Script::new(EXTEND_SCRIPT);
        let ok: i64 = script
            .key(&guard.key)
            .arg(&guard.token)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(ok == 1)
    }

    async fn release(&self, guard: &LockGuard) -> Result<()> {
        let mut conn = self.conn();
        let script = redis::Script::new(RELEASE_SCRIPT);
        let _: i64 = script
            .key(&guard.key)
            .arg(&guard.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// `permissions_sync_lock:<ccp_id>` acquire helper (spec.md §4.3 step 2).
pub async fn acquire_permissions_sync_lock(
    lock: &dyn DistributedLock,
    ccp_id: i64,
    ttl_ms: u64,
    timeout_ms: u64,
) -> Result<Option<LockGuard>> {
    lock.acquire_blocking(&per_ccp_sync_lock_name(ccp_id), ttl_ms, timeout_ms)
        .await
}

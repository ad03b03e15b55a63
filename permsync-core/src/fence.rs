//! Fence Store (spec.md §4.1): a per-CCP advisory Redis lock with a typed
//! payload, a TTL "active" liveness signal, and a taskset index.
//!
//! Grounded in `examples/other_examples/..._cache.rs.rs`'s
//! `ConnectionManager`-based async command style and NX/PX lock-acquire +
//! Lua compare-and-delete release pattern.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::{Error, Result};
use crate::model::FencePayload;

/// TTL of the `active` liveness signal (spec.md §3, §6).
pub const ACTIVE_SIGNAL_TTL_SECS: i64 = 300;

/// Global index of all live fence keys (spec.md §3, §6).
pub const ACTIVE_FENCES_KEY: &str = "active_fences";

pub(crate) fn fence_key(ccp_id: i64) -> String {
    format!("permissionsync_fence:{ccp_id}")
}

fn active_key(ccp_id: i64) -> String {
    format!("permissionsync_active:{ccp_id}")
}

fn taskset_key(ccp_id: i64) -> String {
    format!("permissionsync_taskset:{ccp_id}")
}

fn generator_complete_key(ccp_id: i64) -> String {
    format!("permissionsync_generator_complete:{ccp_id}")
}

fn stop_key(ccp_id: i64) -> String {
    format!("permissionsync_stop:{ccp_id}")
}

/// Prefix used to recognize a permission-sync fence key among the entries
/// of the global `active_fences` set (spec.md §4.2 step 6, §4.5).
pub const FENCE_PREFIX: &str = "permissionsync_fence:";

/// Rate-limit signal gating how often the Fence Validator runs (spec.md
/// §4.2 step 5, §6).
pub const BLOCK_VALIDATE_FENCES_KEY: &str = "BLOCK_VALIDATE_PERMISSION_SYNC_FENCES";

/// Extract the CCP id from a fence key of the form
/// `permissionsync_fence:<ccp_id>`.
pub fn ccp_id_from_fence_key(key: &str) -> Option<i64> {
    key.strip_prefix(FENCE_PREFIX)?.parse().ok()
}

/// The Fence Store contract (spec.md §4.1). All operations are atomic
/// against concurrent workers.
#[async_trait]
pub trait FenceStore: Send + Sync {
    async fn fenced(&self, ccp_id: i64) -> Result<bool>;
    async fn payload(&self, ccp_id: i64) -> Result<Option<FencePayload>>;
    async fn set_fence(&self, ccp_id: i64, payload: Option<FencePayload>) -> Result<()>;
    async fn set_active(&self, ccp_id: i64) -> Result<()>;
    async fn active(&self, ccp_id: i64) -> Result<bool>;
    async fn generator_complete(&self, ccp_id: i64) -> Result<Option<i64>>;
    async fn set_generator_complete(&self, ccp_id: i64, total: i64) -> Result<()>;
    async fn generator_clear(&self, ccp_id: i64) -> Result<()>;
    async fn taskset_clear(&self, ccp_id: i64) -> Result<()>;
    async fn get_remaining(&self, ccp_id: i64) -> Result<i64>;

    /// Every member id currently in the taskset (spec.md §4.5 step 3): the
    /// Fence Validator scans these against the queued/reserved lanes rather
    /// than trusting raw cardinality.
    async fn taskset_members(&self, ccp_id: i64) -> Result<std::collections::HashSet<String>>;

    async fn reset(&self, ccp_id: i64) -> Result<()>;

    /// Snapshot of the `active_fences` index (spec.md §4.5 step 2): every
    /// fence key currently believed live, across all CCPs.
    async fn active_fence_keys(&self) -> Result<std::collections::HashSet<String>>;

    /// Whether an external caller has requested cancellation of this CCP's
    /// in-flight sync (spec.md §5 "Cancellation": `stop.fenced`).
    async fn stop_requested(&self, ccp_id: i64) -> Result<bool>;

    /// Set (or clear) the cancellation signal. Exposed for external
    /// callers and for tests exercising the heartbeat's `should_stop`.
    async fn set_stop_requested(&self, ccp_id: i64, requested: bool) -> Result<()>;

    /// Whether `BLOCK_VALIDATE_PERMISSION_SYNC_FENCES` is currently set
    /// (spec.md §4.2 step 5, §6).
    async fn validate_fences_blocked(&self) -> Result<bool>;

    /// Set the validate-fences rate-limit signal with the given TTL.
    async fn set_validate_fences_blocked(&self, ttl_secs: i64) -> Result<()>;

    /// Drop a stray entry from the `active_fences` index whose fence key
    /// no longer exists (spec.md §4.2 step 6 "remove the stale index
    /// entry"). A no-op for keys not present.
    async fn remove_from_active_index(&self, key: &str) -> Result<()>;
}

/// Redis-backed implementation of the Fence Store.
#[derive(Clone)]
pub struct RedisFenceStore {
    conn: ConnectionManager,
}

impl RedisFenceStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl FenceStore for RedisFenceStore {
    async fn fenced(&self, ccp_id: i64) -> Result<bool> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(fence_key(ccp_id)).await?;
        Ok(exists)
    }

    async fn payload(&self, ccp_id: i64) -> Result<Option<FencePayload>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(fence_key(ccp_id)).await?;
        match raw {
            None => Ok(None),
            Some(s) => {
                let payload: FencePayload =
                    serde_json::from_str(&s).map_err(|source| Error::SchemaMismatch {
                        key: fence_key(ccp_id),
                        source,
                    })?;
                Ok(Some(payload))
            }
        }
    }

    async fn set_fence(&self, ccp_id: i64, payload: Option<FencePayload>) -> Result<()> {
        let mut conn = self.conn();
        let key = fence_key(ccp_id);

        match payload {
            Some(payload) => {
                let encoded =
                    serde_json::to_string(&payload).expect("FencePayload serializes cleanly");
                conn.set(&key, encoded).await?;
                conn.sadd(ACTIVE_FENCES_KEY, &key).await?;
            }
            None => {
                conn.del(&key).await?;
                conn.srem(ACTIVE_FENCES_KEY, &key).await?;
                conn.del(generator_complete_key(ccp_id)).await?;
                conn.del(taskset_key(ccp_id)).await?;
            }
        }
        Ok(())
    }

    async fn set_active(&self, ccp_id: i64) -> Result<()> {
        let mut conn = self.conn();
        conn.set_ex(active_key(ccp_id), 1, ACTIVE_SIGNAL_TTL_SECS as u64)
            .await?;
        Ok(())
    }

    async fn active(&self, ccp_id: i64) -> Result<bool> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(active_key(ccp_id)).await?;
        Ok(exists)
    }

    async fn generator_complete(&self, ccp_id: i64) -> Result<Option<i64>> {
        let mut conn = self.conn();
        let value: Option<i64> = conn.get(generator_complete_key(ccp_id)).await?;
        Ok(value)
    }

    async fn set_generator_complete(&self, ccp_id: i64, total: i64) -> Result<()> {
        let mut conn = self.conn();
        conn.set(generator_complete_key(ccp_id), total).await?;
        Ok(())
    }

    async fn generator_clear(&self, ccp_id: i64) -> Result<()> {
        let mut conn = self.conn();
        conn.del(generator_complete_key(ccp_id)).await?;
        Ok(())
    }

    async fn taskset_clear(&self, ccp_id: i64) -> Result<()> {
        let mut conn = self.conn();
        conn.del(taskset_key(ccp_id)).await?;
        Ok(())
    }

    async fn get_remaining(&self, ccp_id: i64) -> Result<i64> {
        let mut conn = self.conn();
        let remaining: i64 = conn.scard(taskset_key(ccp_id)).await?;
        Ok(remaining)
    }

    async fn taskset_members(&self, ccp_id: i64) -> Result<std::collections::HashSet<String>> {
        let mut conn = self.conn();
        let members: std::collections::HashSet<String> =
            conn.smembers(taskset_key(ccp_id)).await?;
        Ok(members)
    }

    async fn reset(&self, ccp_id: i64) -> Result<()> {
        self.set_fence(ccp_id, None).await?;
        let mut conn = self.conn();
        conn.del(active_key(ccp_id)).await?;
        Ok(())
    }

    async fn active_fence_keys(&self) -> Result<std::collections::HashSet<String>> {
        let mut conn = self.conn();
        let keys: std::collections::HashSet<String> = conn.smembers(ACTIVE_FENCES_KEY).await?;
        Ok(keys)
    }

    async fn stop_requested(&self, ccp_id: i64) -> Result<bool> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(stop_key(ccp_id)).await?;
        Ok(exists)
    }

    async fn set_stop_requested(&self, ccp_id: i64, requested: bool) -> Result<()> {
        let mut conn = self.conn();
        if requested {
            conn.set(stop_key(ccp_id), 1).await?;
        } else {
            conn.del(stop_key(ccp_id)).await?;
        }
        Ok(())
    }

    async fn validate_fences_blocked(&self) -> Result<bool> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(BLOCK_VALIDATE_FENCES_KEY).await?;
        Ok(exists)
    }

    async fn set_validate_fences_blocked(&self, ttl_secs: i64) -> Result<()> {
        let mut conn = self.conn();
        conn.set_ex(BLOCK_VALIDATE_FENCES_KEY, 1, ttl_secs.max(1) as u64)
            .await?;
        Ok(())
    }

    async fn remove_from_active_index(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.srem(ACTIVE_FENCES_KEY, key).await?;
        Ok(())
    }
}

/// Build a fresh fence payload (spec.md §4.2.2): `id` is a short random
/// correlation id, `submitted` is now, `started`/`celery_task_id` are
/// unset until the generator task is enqueued and observes the fence.
pub fn new_fence_payload(short_id: String) -> FencePayload {
    FencePayload {
        id: short_id,
        submitted: Utc::now(),
        started: None,
        celery_task_id: None,
    }
}

/// Generate a short random id for log correlation (`make_short_id` in the
/// original).
pub fn make_short_id() -> String {
    use rand::distributions::Alphanumeric;
    use rand::{thread_rng, Rng};
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

//! Beat Scheduler (spec.md §4.2), grounded on
//! `tasks.py::check_for_doc_permissions_sync` and
//! `::try_creating_permissions_sync_task`.

use std::time::Duration;

use uuid::Uuid;

use crate::config::{RuntimeConfig, SourceSyncRegistry};
use crate::db::{AclDatabase, CcpRepository};
use crate::due::is_sync_due;
use crate::fence::{ccp_id_from_fence_key, new_fence_payload, FenceStore};
use crate::lock::{DistributedLock, LockGuard, BEAT_LOCK_NAME, FENCE_CREATE_LOCK_NAME};
use crate::model::SyncType;
use crate::monitor::monitor_ccpair_permissions_taskset;
use crate::queue::{Priority, TaskQueue, CONNECTOR_DOC_PERMISSIONS_SYNC};
use crate::validator::validate_permission_sync_fences;

use crate::error::Result;

/// `CELERY_GENERIC_BEAT_LOCK_TIMEOUT`: how long `beat_lock` stays valid
/// between reacquisitions (spec.md §4.2 step 1).
pub const BEAT_LOCK_TTL: Duration = Duration::from_secs(120);
/// Blocking wait for the fence-creation function lock (spec.md §4.2.2).
pub const FENCE_CREATE_LOCK_TIMEOUT: Duration = Duration::from_secs(15);
/// TTL held by the fence-creation function lock while it runs.
pub const FENCE_CREATE_LOCK_TTL: Duration = Duration::from_secs(15);
/// Base TTL for `BLOCK_VALIDATE_PERMISSION_SYNC_FENCES` (spec.md §4.2 step
/// 5, §6); scaled by `beat_multiplier` only in multi-tenant mode.
pub const BLOCK_VALIDATE_FENCES_BASE_SECS: i64 = 300;

/// Everything one beat tick needs.
pub struct BeatContext<'a> {
    pub fences: &'a dyn FenceStore,
    pub lock: &'a dyn DistributedLock,
    pub queue: &'a dyn TaskQueue,
    pub ccp_repo: &'a dyn CcpRepository,
    pub db: &'a dyn AclDatabase,
    pub registry: &'a SourceSyncRegistry,
    pub runtime: &'a dyn RuntimeConfig,
    /// `permissions.fenced`/`delete.fenced`/`prune.fenced` equivalents from
    /// the other (out-of-scope) lifecycle subsystems (spec.md §4.2.2 step
    /// 2): returns true if any other lifecycle operation holds a fence on
    /// this CCP.
    pub other_lifecycle_fenced: &'a (dyn Fn(i64) -> bool + Sync),
}

/// `check_for_doc_permissions_sync`: one beat tick.
///
/// Never propagates an error — per spec.md §7 "the Beat Scheduler never
/// re-raises; its job is to remain alive across ticks." Failures are
/// logged and the tick ends early; the lock is always released.
pub async fn check_for_doc_permissions_sync(ctx: &BeatContext<'_>) {
    let guard = match ctx
        .lock
        .try_acquire(BEAT_LOCK_NAME, BEAT_LOCK_TTL.as_millis() as u64)
        .await
    {
        Ok(Some(guard)) => guard,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(error = %e, "failed to acquire beat_lock");
            return;
        }
    };

    if let Err(e) = run_tick(ctx, &guard).await {
        tracing::error!(error = %e, "beat tick ended with an error, resuming next tick");
    }

    if let Err(e) = ctx.lock.release(&guard).await {
        tracing::warn!(error = %e, "failed to release beat_lock");
    }
}

async fn run_tick(ctx: &BeatContext<'_>, guard: &LockGuard) -> Result<()> {
    let ccps = ctx.ccp_repo.get_all_auto_sync_cc_pairs().await?;
    let now = chrono::Utc::now();
    let due_ids: Vec<i64> = ccps
        .iter()
        .filter(|ccp| {
            let cfg = ctx.registry.get(&ccp.source);
            is_sync_due(ccp, cfg.as_deref(), ctx.runtime, now)
        })
        .map(|ccp| ccp.id)
        .collect();

    if !reacquire(ctx, guard).await? {
        return Ok(());
    }
    for ccp_id in due_ids {
        let _ = try_creating_permissions_sync_task(ctx, ccp_id).await;
    }

    if !reacquire(ctx, guard).await? {
        return Ok(());
    }
    if !ctx.fences.validate_fences_blocked().await? {
        validate_permission_sync_fences(ctx.fences, ctx.queue).await?;
        let ttl = if ctx.runtime.multi_tenant() {
            (BLOCK_VALIDATE_FENCES_BASE_SECS as f64 * ctx.runtime.beat_multiplier()) as i64
        } else {
            BLOCK_VALIDATE_FENCES_BASE_SECS
        };
        ctx.fences.set_validate_fences_blocked(ttl).await?;
    }

    if !reacquire(ctx, guard).await? {
        return Ok(());
    }
    for key in ctx.fences.active_fence_keys().await? {
        let Some(ccp_id) = ccp_id_from_fence_key(&key) else {
            continue;
        };
        if !ctx.fences.fenced(ccp_id).await? {
            ctx.fences.remove_from_active_index(&key).await?;
            continue;
        }
        monitor_ccpair_permissions_taskset(ctx.fences, ctx.db, ccp_id).await?;
    }

    Ok(())
}

/// Extends `beat_lock`'s TTL (spec.md §4.2 steps 4-6 "Reacquire lock").
/// Returns `false` if the lock was lost, in which case the caller must
/// stop the tick immediately.
async fn reacquire(ctx: &BeatContext<'_>, guard: &LockGuard) -> Result<bool> {
    let extended = ctx.lock.extend(guard, BEAT_LOCK_TTL.as_millis() as u64).await?;
    if !extended {
        tracing::warn!("beat_lock lost mid-tick, aborting remaining steps");
    }
    Ok(extended)
}

/// `try_creating_permissions_sync_task` (spec.md §4.2.2). Returns the
/// fence payload id on success; `None` on any failure mode, all of which
/// are logged and tolerated — left for the Fence Validator to reap.
pub async fn try_creating_permissions_sync_task(ctx: &BeatContext<'_>, ccp_id: i64) -> Option<String> {
    match try_creating_permissions_sync_task_inner(ctx, ccp_id).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(ccp_id, error = %e, "try_creating_permissions_sync_task failed");
            None
        }
    }
}

async fn try_creating_permissions_sync_task_inner(
    ctx: &BeatContext<'_>,
    ccp_id: i64,
) -> Result<Option<String>> {
    let Some(guard) = ctx
        .lock
        .acquire_blocking(
            FENCE_CREATE_LOCK_NAME,
            FENCE_CREATE_LOCK_TTL.as_millis() as u64,
            FENCE_CREATE_LOCK_TIMEOUT.as_millis() as u64,
        )
        .await?
    else {
        return Ok(None);
    };

    let result = create_fence_and_enqueue(ctx, ccp_id).await;
    ctx.lock.release(&guard).await?;
    result
}

async fn create_fence_and_enqueue(ctx: &BeatContext<'_>, ccp_id: i64) -> Result<Option<String>> {
    if (ctx.other_lifecycle_fenced)(ccp_id) {
        tracing::info!(ccp_id, "another lifecycle operation is in flight, skipping");
        return Ok(None);
    }

    ctx.fences.generator_clear(ccp_id).await?;
    ctx.fences.taskset_clear(ccp_id).await?;

    if let Err(e) = ctx
        .db
        .insert_sync_record(ccp_id, SyncType::ExternalPermissions)
        .await
    {
        // DB failures here are logged and tolerated (spec.md §4.2.2): a
        // missing SyncRecord still lets the fence-based pipeline run; it
        // just won't have progress bookkeeping.
        tracing::warn!(ccp_id, error = %e, "failed to insert sync record");
    }

    ctx.fences.set_active(ccp_id).await?;

    let short_id = crate::fence::make_short_id();
    let payload = new_fence_payload(short_id.clone());
    ctx.fences.set_fence(ccp_id, Some(payload.clone())).await?;

    let task_id = format!("connector_permission_sync_generator_task_{ccp_id}_{}", Uuid::new_v4());
    let enqueued_id = ctx
        .queue
        .enqueue(CONNECTOR_DOC_PERMISSIONS_SYNC, &task_id, Priority::Medium)
        .await?;

    let mut started_payload = payload;
    started_payload.celery_task_id = Some(enqueued_id);
    ctx.fences.set_fence(ccp_id, Some(started_payload)).await?;

    Ok(Some(short_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AccessType, ConnectorCredentialPair, ConnectorCredentialPairStatus, DocExternalAccess,
        DocumentSource, SyncStatus, SyncType,
    };
    use crate::test_support::{FakeFenceStore, FakeTaskQueue};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeLock {
        held: Mutex<std::collections::HashMap<String, String>>,
    }

    impl Default for FakeLock {
        fn default() -> Self {
            Self {
                held: Mutex::new(std::collections::HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl DistributedLock for FakeLock {
        async fn try_acquire(&self, name: &str, _ttl_ms: u64) -> Result<Option<LockGuard>> {
            let mut held = self.held.lock().unwrap();
            if held.contains_key(name) {
                return Ok(None);
            }
            held.insert(name.to_string(), "tok".to_string());
            Ok(Some(LockGuard::for_test(name, "tok")))
        }

        async fn acquire_blocking(
            &self,
            name: &str,
            ttl_ms: u64,
            _timeout_ms: u64,
        ) -> Result<Option<LockGuard>> {
            self.try_acquire(name, ttl_ms).await
        }

        async fn extend(&self, _guard: &LockGuard, _ttl_ms: u64) -> Result<bool> {
            Ok(true)
        }

        async fn release(&self, guard: &LockGuard) -> Result<()> {
            self.held.lock().unwrap().remove(guard.key());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeCcpRepo {
        ccps: Vec<ConnectorCredentialPair>,
    }

    #[async_trait]
    impl CcpRepository for FakeCcpRepo {
        async fn get_all_auto_sync_cc_pairs(&self) -> Result<Vec<ConnectorCredentialPair>> {
            Ok(self.ccps.clone())
        }
        async fn get_connector_credential_pair_from_id(
            &self,
            id: i64,
        ) -> Result<Option<ConnectorCredentialPair>> {
            Ok(self.ccps.iter().find(|c| c.id == id).cloned())
        }
    }

    #[derive(Default)]
    struct RecordingDb {
        inserted: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl AclDatabase for RecordingDb {
        async fn upsert_document_external_perms(
            &self,
            _doc: &DocExternalAccess,
            _source_type: &str,
        ) -> Result<bool> {
            Ok(true)
        }
        async fn upsert_document_by_connector_credential_pair(
            &self,
            _connector_id: i64,
            _credential_id: i64,
            _doc_ids: &[String],
        ) -> Result<()> {
            Ok(())
        }
        async fn batch_add_ext_perm_user_if_not_exists(&self, _emails: &[String]) -> Result<()> {
            Ok(())
        }
        async fn insert_sync_record(&self, ccp_id: i64, _sync_type: SyncType) -> Result<i64> {
            self.inserted.lock().unwrap().push(ccp_id);
            Ok(1)
        }
        async fn update_sync_record_status(
            &self,
            _ccp_id: i64,
            _sync_type: SyncType,
            _status: SyncStatus,
            _n: Option<i64>,
        ) -> Result<()> {
            Ok(())
        }
        async fn mark_cc_pair_as_permissions_synced(
            &self,
            _ccp_id: i64,
            _synced_at: chrono::DateTime<chrono::Utc>,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn ccp(id: i64) -> ConnectorCredentialPair {
        ConnectorCredentialPair {
            id,
            connector_id: 1,
            credential_id: 1,
            source: DocumentSource::Slack,
            access_type: AccessType::Sync,
            status: ConnectorCredentialPairStatus::Active,
            last_successful_index_time: None,
            last_time_perm_sync: None,
        }
    }

    #[tokio::test]
    async fn try_creating_sync_task_sets_fence_and_enqueues() {
        let fences = FakeFenceStore::default();
        let lock = FakeLock::default();
        let queue = FakeTaskQueue::default();
        let ccp_repo = FakeCcpRepo::default();
        let db = RecordingDb::default();
        let registry = SourceSyncRegistry::new();
        let runtime = crate::config::StaticRuntimeConfig::default();
        let always_clear = |_ccp_id: i64| false;

        let ctx = BeatContext {
            fences: &fences,
            lock: &lock,
            queue: &queue,
            ccp_repo: &ccp_repo,
            db: &db,
            registry: &registry,
            runtime: &runtime,
            other_lifecycle_fenced: &always_clear,
        };

        let id = try_creating_permissions_sync_task(&ctx, 42).await;
        assert!(id.is_some());
        assert!(fences.fenced(42).await.unwrap());
        let payload = fences.payload(42).await.unwrap().unwrap();
        assert!(payload.celery_task_id.is_some());
        assert_eq!(db.inserted.lock().unwrap().as_slice(), [42]);
    }

    #[tokio::test]
    async fn other_lifecycle_fence_blocks_task_creation() {
        let fences = FakeFenceStore::default();
        let lock = FakeLock::default();
        let queue = FakeTaskQueue::default();
        let ccp_repo = FakeCcpRepo::default();
        let db = RecordingDb::default();
        let registry = SourceSyncRegistry::new();
        let runtime = crate::config::StaticRuntimeConfig::default();
        let always_fenced = |_ccp_id: i64| true;

        let ctx = BeatContext {
            fences: &fences,
            lock: &lock,
            queue: &queue,
            ccp_repo: &ccp_repo,
            db: &db,
            registry: &registry,
            runtime: &runtime,
            other_lifecycle_fenced: &always_fenced,
        };

        let id = try_creating_permissions_sync_task(&ctx, 7).await;
        assert!(id.is_none());
        assert!(!fences.fenced(7).await.unwrap());
    }

    #[tokio::test]
    async fn full_tick_creates_fences_for_due_ccps() {
        let fences = FakeFenceStore::default();
        let lock = FakeLock::default();
        let queue = FakeTaskQueue::default();
        let ccp_repo = FakeCcpRepo {
            ccps: vec![ccp(1), ccp(2)],
        };
        let db = RecordingDb::default();
        let registry = SourceSyncRegistry::new();
        registry.register(
            DocumentSource::Slack,
            crate::model::SourceSyncConfig {
                doc_sync_frequency_secs: 60,
                initial_index_should_sync: false,
                doc_sync_config: Some(std::sync::Arc::new(NoopDocSync)),
                censoring_config: None,
            },
        );
        let runtime = crate::config::StaticRuntimeConfig::default();
        let always_clear = |_ccp_id: i64| false;

        let ctx = BeatContext {
            fences: &fences,
            lock: &lock,
            queue: &queue,
            ccp_repo: &ccp_repo,
            db: &db,
            registry: &registry,
            runtime: &runtime,
            other_lifecycle_fenced: &always_clear,
        };

        check_for_doc_permissions_sync(&ctx).await;

        assert!(fences.fenced(1).await.unwrap());
        assert!(fences.fenced(2).await.unwrap());
    }

    struct NoopDocSync;
    impl crate::model::DocSync for NoopDocSync {
        fn sync(
            &self,
            _cc_pair: &ConnectorCredentialPair,
            _fetch_all_docs: &dyn Fn(
                Option<crate::model::SortOrder>,
            ) -> Vec<crate::model::DocumentRow>,
            _fetch_all_doc_ids: &dyn Fn() -> Vec<String>,
            _heartbeat: &dyn crate::model::Heartbeat,
        ) -> Box<dyn Iterator<Item = DocExternalAccess> + Send> {
            Box::new(std::iter::empty())
        }
    }
}

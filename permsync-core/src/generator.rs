//! Generator Worker (spec.md §4.3), grounded on
//! `tasks.py::connector_permission_sync_generator_task` and
//! `tasks.py::PermissionSyncCallback`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::sleep;

use crate::config::SourceSyncRegistry;
use crate::db::{AclDatabase, CcpRepository};
use crate::error::{Error, Result};
use crate::fence::{new_fence_payload, FenceStore};
use crate::lock::{acquire_permissions_sync_lock, DistributedLock, LockGuard};
use crate::model::{ConnectorCredentialPair, CredentialValidator, DocumentRow, Heartbeat, SortOrder};
use crate::upsert::document_update_permissions;

/// Bound on the fence-readiness wait (spec.md §4.3 step 1,
/// `CELERY_TASK_WAIT_FOR_FENCE_TIMEOUT`).
pub const FENCE_READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval while waiting for the fence to become ready.
pub const FENCE_READY_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// TTL of `permissions_sync_lock:<ccp_id>` (spec.md §4.3 step 2,
/// `CELERY_PERMISSIONS_SYNC_LOCK_TIMEOUT`); re-extended by the heartbeat
/// every quarter of this duration.
pub const SYNC_LOCK_TTL: Duration = Duration::from_secs(30 * 60);

/// Everything the generator needs from the outside world. Grouped into one
/// struct because the worker touches every collaborator in the system —
/// passing each as a bare parameter would make every call site unreadable.
pub struct GeneratorContext<'a> {
    pub fences: &'a dyn FenceStore,
    pub lock: &'a dyn DistributedLock,
    pub ccp_repo: &'a dyn CcpRepository,
    pub registry: &'a SourceSyncRegistry,
    pub credential_validator: &'a dyn CredentialValidator,
    pub db: &'a dyn AclDatabase,
    pub fetch_all_docs: &'a dyn Fn(Option<SortOrder>) -> Vec<DocumentRow>,
    pub fetch_all_doc_ids: &'a dyn Fn() -> Vec<String>,
}

/// `connector_permission_sync_generator_task`.
pub async fn connector_permission_sync_generator_task(
    ctx: &GeneratorContext<'_>,
    ccp_id: i64,
) -> Result<()> {
    wait_for_fence_ready(ctx.fences, ccp_id).await?;

    let Some(guard) =
        acquire_permissions_sync_lock(ctx.lock, ccp_id, SYNC_LOCK_TTL.as_millis() as u64, 0)
            .await?
    else {
        tracing::info!(ccp_id, "permissions_sync_lock already held, skipping");
        return Ok(());
    };

    let result = run_sync(ctx, ccp_id, &guard).await;

    // Released on every exit path (spec.md §4.3 step 11), success or not.
    ctx.lock.release(&guard).await?;

    result
}

/// Runs the drain, clearing the fence on *any* error — cc_pair lookup,
/// credential validation, missing sync config, and the later drain/commit
/// failures alike (spec.md §4.3 step 10: the whole body is one try/except
/// in the original, not a handful of individually-guarded call sites).
async fn run_sync(ctx: &GeneratorContext<'_>, ccp_id: i64, guard: &LockGuard) -> Result<()> {
    let result = run_sync_body(ctx, ccp_id, guard).await;
    if result.is_err() {
        clean_up_fence(ctx.fences, ccp_id).await;
    }
    result
}

async fn run_sync_body(ctx: &GeneratorContext<'_>, ccp_id: i64, guard: &LockGuard) -> Result<()> {
    let cc_pair = ctx
        .ccp_repo
        .get_connector_credential_pair_from_id(ccp_id)
        .await?
        .ok_or_else(|| Error::Fatal(format!("cc_pair {ccp_id} not found")))?;

    ctx.credential_validator
        .validate(&cc_pair)
        .map_err(|e| Error::Fatal(format!("credential validation failed for {ccp_id}: {e}")))?;

    let sync_config = ctx.registry.get(&cc_pair.source);
    let doc_sync_func = match &sync_config {
        Some(cfg) if cfg.doc_sync_config.is_some() => cfg.doc_sync_config.clone().unwrap(),
        Some(cfg) if cfg.censoring_config.is_some() => {
            tracing::info!(ccp_id, "censoring-only source, no doc sync work");
            return Ok(());
        }
        _ => {
            return Err(Error::Fatal(format!(
                "no sync config for source of cc_pair {ccp_id}"
            )))
        }
    };

    update_fence_started(ctx.fences, ccp_id).await?;

    let lock_lost = Arc::new(AtomicBool::new(false));
    let heartbeat = GeneratorHeartbeat {
        fences: ctx.fences,
        ccp_id,
        lock: ctx.lock,
        guard: Mutex::new(clone_guard(guard)),
        lock_ttl: SYNC_LOCK_TTL,
        last_extend: Mutex::new(Instant::now()),
        lock_lost: lock_lost.clone(),
    };

    let iter = doc_sync_func.sync(
        &cc_pair,
        ctx.fetch_all_docs,
        ctx.fetch_all_doc_ids,
        &heartbeat,
    );

    let mut tasks_generated: i64 = 0;
    for doc in iter {
        if lock_lost.load(Ordering::SeqCst) {
            return Err(Error::LockLost(format!(
                "permissions_sync_lock:{ccp_id} lost during drain"
            )));
        }
        document_update_permissions(
            ctx.db,
            &doc,
            &cc_pair.source.to_string(),
            cc_pair.connector_id,
            cc_pair.credential_id,
        )
        .await?;
        tasks_generated += 1;
    }

    ctx.fences
        .set_generator_complete(ccp_id, tasks_generated)
        .await?;

    Ok(())
}

async fn wait_for_fence_ready(fences: &dyn FenceStore, ccp_id: i64) -> Result<()> {
    let deadline = Instant::now() + FENCE_READY_TIMEOUT;
    loop {
        match fences.payload(ccp_id).await {
            Ok(Some(payload)) if payload.celery_task_id.is_some() => return Ok(()),
            Ok(Some(_)) | Ok(None) => {}
            Err(Error::SchemaMismatch { .. }) => {}
            Err(e) => return Err(e),
        }
        if Instant::now() >= deadline {
            return Err(Error::FenceTimeout(format!(
                "fence for cc_pair {ccp_id} never became ready"
            )));
        }
        sleep(FENCE_READY_POLL_INTERVAL).await;
    }
}

async fn update_fence_started(fences: &dyn FenceStore, ccp_id: i64) -> Result<()> {
    let Some(mut payload) = fences.payload(ccp_id).await? else {
        return Err(Error::Fatal(format!(
            "fence for cc_pair {ccp_id} vanished before generator could start"
        )));
    };
    payload.started = Some(chrono::Utc::now());
    fences.set_fence(ccp_id, Some(payload)).await
}

/// Spec.md §4.3 step 10: clear `generator_complete`, clear taskset, delete
/// the fence. Errors here are logged, not propagated — the original error
/// that triggered cleanup is what gets re-raised.
async fn clean_up_fence(fences: &dyn FenceStore, ccp_id: i64) {
    if let Err(e) = fences.generator_clear(ccp_id).await {
        tracing::warn!(ccp_id, error = %e, "failed to clear generator_complete during cleanup");
    }
    if let Err(e) = fences.taskset_clear(ccp_id).await {
        tracing::warn!(ccp_id, error = %e, "failed to clear taskset during cleanup");
    }
    if let Err(e) = fences.set_fence(ccp_id, None).await {
        tracing::warn!(ccp_id, error = %e, "failed to delete fence during cleanup");
    }
}

fn clone_guard(guard: &LockGuard) -> LockGuard {
    guard.clone()
}

/// `PermissionSyncCallback` (spec.md §4.3.1).
///
/// `Heartbeat`'s methods are synchronous because `DocSync::sync` returns a
/// plain synchronous `Iterator` pulled from a single cooperative worker
/// thread (spec.md §9 design note, §5 "single-threaded cooperative"); the
/// bridge into the async `FenceStore`/`DistributedLock` calls uses
/// `block_in_place` + `Handle::block_on`, safe here because the generator
/// runs on a multi-threaded Tokio runtime and never nests two such bridges.
struct GeneratorHeartbeat<'a> {
    fences: &'a dyn FenceStore,
    ccp_id: i64,
    lock: &'a dyn DistributedLock,
    guard: Mutex<LockGuard>,
    lock_ttl: Duration,
    last_extend: Mutex<Instant>,
    lock_lost: Arc<AtomicBool>,
}

impl Heartbeat for GeneratorHeartbeat<'_> {
    fn should_stop(&self) -> bool {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(self.fences.stop_requested(self.ccp_id))
        })
        .unwrap_or(false)
    }

    fn progress(&self, tag: &str, amount: i64) {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async {
                if let Err(e) = self.fences.set_active(self.ccp_id).await {
                    tracing::warn!(ccp_id = self.ccp_id, error = %e, tag, amount, "failed to renew active signal");
                }

                let should_extend = {
                    let last = *self.last_extend.lock().unwrap();
                    last.elapsed() >= self.lock_ttl / 4
                };
                if !should_extend {
                    return;
                }

                let current = { self.guard.lock().unwrap().clone() };
                match self.lock.extend(&current, self.lock_ttl.as_millis() as u64).await {
                    Ok(true) => *self.last_extend.lock().unwrap() = Instant::now(),
                    Ok(false) => {
                        tracing::error!(ccp_id = self.ccp_id, "permissions_sync_lock lost, worker unhealthy");
                        self.lock_lost.store(true, Ordering::SeqCst);
                    }
                    Err(e) => {
                        tracing::error!(ccp_id = self.ccp_id, error = %e, "lock extend failed, worker unhealthy");
                        self.lock_lost.store(true, Ordering::SeqCst);
                    }
                }
            })
        });
    }
}

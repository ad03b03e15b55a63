//! Progress Monitor (spec.md §4.6), grounded on
//! `tasks.py::monitor_ccpair_permissions_taskset`.

use crate::db::AclDatabase;
use crate::error::Result;
use crate::fence::{ccp_id_from_fence_key, FenceStore};
use crate::model::{SyncStatus, SyncType};

/// Telemetry emitted by the monitor (spec.md §6 "Telemetry records
/// emitted"). Logged via `tracing`; no telemetry sink is in scope here
/// (spec.md §1 Non-goals).
#[derive(Debug, Clone)]
pub enum ProgressTelemetry {
    Progress {
        ccp_id: i64,
        total_docs_synced: i64,
        remaining_docs_to_sync: i64,
    },
    Complete {
        ccp_id: i64,
    },
}

fn emit(event: ProgressTelemetry) {
    match event {
        ProgressTelemetry::Progress {
            ccp_id,
            total_docs_synced,
            remaining_docs_to_sync,
        } => tracing::info!(
            ccp_id,
            total_docs_synced,
            remaining_docs_to_sync,
            "PERMISSION_SYNC_PROGRESS"
        ),
        ProgressTelemetry::Complete { ccp_id } => {
            tracing::info!(ccp_id, "PERMISSION_SYNC_COMPLETE")
        }
    }
}

/// Finalize a single fence identified by its raw Redis key, if drained.
pub async fn monitor_fence_key(
    fences: &dyn FenceStore,
    db: &dyn AclDatabase,
    fence_key: &str,
) -> Result<()> {
    let Some(ccp_id) = ccp_id_from_fence_key(fence_key) else {
        return Ok(());
    };
    monitor_ccpair_permissions_taskset(fences, db, ccp_id).await
}

/// `monitor_ccpair_permissions_taskset`.
pub async fn monitor_ccpair_permissions_taskset(
    fences: &dyn FenceStore,
    db: &dyn AclDatabase,
    ccp_id: i64,
) -> Result<()> {
    if !fences.fenced(ccp_id).await? {
        return Ok(());
    }

    let payload = match fences.payload(ccp_id).await {
        Ok(p) => p,
        Err(crate::error::Error::SchemaMismatch { .. }) => return Ok(()),
        Err(e) => return Err(e),
    };
    let Some(payload) = payload else {
        return Ok(());
    };

    let Some(generator_complete) = fences.generator_complete(ccp_id).await? else {
        return Ok(());
    };

    let remaining = fences.get_remaining(ccp_id).await?;
    emit(ProgressTelemetry::Progress {
        ccp_id,
        total_docs_synced: generator_complete,
        remaining_docs_to_sync: remaining,
    });

    if remaining > 0 {
        return Ok(());
    }

    let synced_at = payload.started.unwrap_or_else(chrono::Utc::now);
    db.mark_cc_pair_as_permissions_synced(ccp_id, synced_at)
        .await?;
    db.update_sync_record_status(
        ccp_id,
        SyncType::ExternalPermissions,
        SyncStatus::Success,
        Some(generator_complete),
    )
    .await?;
    emit(ProgressTelemetry::Complete { ccp_id });
    fences.reset(ccp_id).await?;
    Ok(())
}

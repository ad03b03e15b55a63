//! Fence Validator (spec.md §4.5), grounded on
//! `tasks.py::validate_permission_sync_fences` /
//! `validate_permission_sync_fence`.

use std::collections::HashSet;

use crate::fence::{ccp_id_from_fence_key, FenceStore, FENCE_PREFIX};
use crate::queue::{TaskQueue, CONNECTOR_DOC_PERMISSIONS_SYNC, DOC_PERMISSIONS_UPSERT};

/// Skip validation entirely once the upsert lane is this deep (spec.md
/// §4.5 step 1): inspecting membership against a huge queue is too
/// expensive to do on every beat tick.
pub const UPSERT_QUEUE_BUDGET_LIMIT: i64 = 1024;

/// `validate_permission_sync_fences`: walk every key in `active_fences`
/// matching the permission-sync prefix and reset any whose generator task
/// has vanished.
pub async fn validate_permission_sync_fences(
    fences: &dyn FenceStore,
    queue: &dyn TaskQueue,
) -> crate::error::Result<()> {
    let upsert_queue_len = queue.queue_len(DOC_PERMISSIONS_UPSERT).await?;
    if upsert_queue_len > UPSERT_QUEUE_BUDGET_LIMIT {
        tracing::info!(
            upsert_queue_len,
            "skipping fence validation: upsert lane over budget"
        );
        return Ok(());
    }

    let queued = queue.queued_task_ids(CONNECTOR_DOC_PERMISSIONS_SYNC).await?;
    let reserved = queue
        .reserved_task_ids(CONNECTOR_DOC_PERMISSIONS_SYNC)
        .await?;

    let keys = fences.active_fence_keys().await?;
    for key in keys {
        if !key.starts_with(FENCE_PREFIX) {
            continue;
        }
        let Some(ccp_id) = ccp_id_from_fence_key(&key) else {
            continue;
        };
        validate_one(fences, ccp_id, &queued, &reserved).await?;
    }
    Ok(())
}

/// `validate_permission_sync_fence`: validate a single CCP's fence.
async fn validate_one(
    fences: &dyn FenceStore,
    ccp_id: i64,
    queued: &HashSet<String>,
    reserved: &HashSet<String>,
) -> crate::error::Result<()> {
    let payload = match fences.payload(ccp_id).await {
        Ok(p) => p,
        Err(crate::error::Error::SchemaMismatch { .. }) => {
            tracing::warn!(ccp_id, "fence payload unparseable, resetting");
            fences.reset(ccp_id).await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let Some(payload) = payload else {
        return Ok(());
    };

    let Some(task_id) = payload.celery_task_id else {
        return Ok(());
    };

    if queued.contains(&task_id) || reserved.contains(&task_id) {
        fences.set_active(ccp_id).await?;
        return Ok(());
    }

    let members = fences.taskset_members(ccp_id).await?;
    let tasks_scanned = members.len();
    let tasks_not_in_celery = members
        .iter()
        .filter(|id| !queued.contains(*id) && !reserved.contains(*id))
        .count();
    if tasks_scanned > 0 && tasks_not_in_celery == 0 {
        // Every outstanding subtask id is accounted for in a lane; the
        // fan-out is still in flight, not a dangling remnant.
        fences.set_active(ccp_id).await?;
        return Ok(());
    }

    if fences.active(ccp_id).await? {
        return Ok(());
    }

    tracing::warn!(ccp_id, task_id, "generator task missing, resetting fence");
    fences.reset(ccp_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::new_fence_payload;
    use crate::model::FencePayload;
    use crate::test_support::{FakeFenceStore, FakeTaskQueue};

    async fn seed_fence(fences: &FakeFenceStore, ccp_id: i64, task_id: Option<&str>) {
        let mut payload = new_fence_payload("abc12345".to_string());
        payload.celery_task_id = task_id.map(|s| s.to_string());
        fences.set_fence(ccp_id, Some(payload)).await.unwrap();
    }

    #[tokio::test]
    async fn task_found_in_queue_renews_active_and_keeps_fence() {
        let fences = FakeFenceStore::default();
        let queue = FakeTaskQueue::default();
        seed_fence(&fences, 1, Some("t1")).await;
        queue
            .enqueue(CONNECTOR_DOC_PERMISSIONS_SYNC, "t1", crate::queue::Priority::Medium)
            .await
            .unwrap();

        validate_permission_sync_fences(&fences, &queue).await.unwrap();

        assert!(fences.fenced(1).await.unwrap());
        assert!(fences.active(1).await.unwrap());
    }

    #[tokio::test]
    async fn task_missing_everywhere_and_no_active_signal_resets_fence() {
        let fences = FakeFenceStore::default();
        let queue = FakeTaskQueue::default();
        seed_fence(&fences, 2, Some("gone")).await;

        validate_permission_sync_fences(&fences, &queue).await.unwrap();

        assert!(!fences.fenced(2).await.unwrap());
    }

    #[tokio::test]
    async fn task_missing_but_active_signal_live_keeps_fence() {
        let fences = FakeFenceStore::default();
        let queue = FakeTaskQueue::default();
        seed_fence(&fences, 3, Some("gone")).await;
        fences.set_active(3).await.unwrap();

        validate_permission_sync_fences(&fences, &queue).await.unwrap();

        assert!(fences.fenced(3).await.unwrap());
    }

    #[tokio::test]
    async fn null_celery_task_id_is_skipped() {
        let fences = FakeFenceStore::default();
        let queue = FakeTaskQueue::default();
        seed_fence(&fences, 4, None).await;

        validate_permission_sync_fences(&fences, &queue).await.unwrap();

        assert!(fences.fenced(4).await.unwrap());
    }

    #[tokio::test]
    async fn unparseable_payload_is_reset() {
        let fences = FakeFenceStore::default();
        let queue = FakeTaskQueue::default();
        fences.set_raw_payload(5, "{not json");
        fences.index_as_active(5);

        validate_permission_sync_fences(&fences, &queue).await.unwrap();

        assert!(!fences.fenced(5).await.unwrap());
    }

    #[tokio::test]
    async fn over_budget_upsert_queue_skips_validation_entirely() {
        let fences = FakeFenceStore::default();
        let queue = FakeTaskQueue::default();
        seed_fence(&fences, 6, Some("gone")).await;
        for i in 0..(UPSERT_QUEUE_BUDGET_LIMIT + 1) {
            queue
                .enqueue(DOC_PERMISSIONS_UPSERT, &format!("u{i}"), crate::queue::Priority::Low)
                .await
                .unwrap();
        }

        validate_permission_sync_fences(&fences, &queue).await.unwrap();

        // Fence would normally be reset; budget guard leaves it untouched.
        assert!(fences.fenced(6).await.unwrap());
    }

    #[test]
    fn fence_payload_round_trips_through_json() {
        let payload = FencePayload {
            id: "x".into(),
            submitted: chrono::Utc::now(),
            started: None,
            celery_task_id: Some("t".into()),
        };
        let encoded = serde_json::to_string(&payload).unwrap();
        let decoded: FencePayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(payload, decoded);
    }
}

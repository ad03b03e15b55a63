//! In-memory fakes for the Fence Store and Task Queue traits, used to unit
//! test the Beat Scheduler, Fence Validator and Progress Monitor without a
//! real Redis instance (grounded in the fake-over-trait style of
//! `examples/other_examples/...distributed_lock_test.rs.rs`, which tests
//! `DistributedLock` against a real container; here we go one step
//! lighter-weight and fake the trait directly for fast, hermetic unit
//! tests).

#![cfg(test)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;
use crate::fence::FenceStore;
use crate::model::FencePayload;
use crate::queue::{Priority, TaskQueue};

#[derive(Default)]
pub struct FakeTaskQueue {
    queued: Mutex<HashMap<String, HashSet<String>>>,
    reserved: Mutex<HashMap<String, HashSet<String>>>,
}

#[async_trait]
impl TaskQueue for FakeTaskQueue {
    async fn enqueue(&self, lane: &str, task_id: &str, _priority: Priority) -> Result<String> {
        self.queued
            .lock()
            .unwrap()
            .entry(lane.to_string())
            .or_default()
            .insert(task_id.to_string());
        Ok(task_id.to_string())
    }

    async fn queued_task_ids(&self, lane: &str) -> Result<HashSet<String>> {
        Ok(self
            .queued
            .lock()
            .unwrap()
            .get(lane)
            .cloned()
            .unwrap_or_default())
    }

    async fn reserved_task_ids(&self, lane: &str) -> Result<HashSet<String>> {
        Ok(self
            .reserved
            .lock()
            .unwrap()
            .get(lane)
            .cloned()
            .unwrap_or_default())
    }

    async fn queue_len(&self, lane: &str) -> Result<i64> {
        Ok(self
            .queued
            .lock()
            .unwrap()
            .get(lane)
            .map(|s| s.len())
            .unwrap_or(0) as i64)
    }

    async fn reserve(&self, lane: &str, task_id: &str) -> Result<()> {
        self.queued
            .lock()
            .unwrap()
            .entry(lane.to_string())
            .or_default()
            .remove(task_id);
        self.reserved
            .lock()
            .unwrap()
            .entry(lane.to_string())
            .or_default()
            .insert(task_id.to_string());
        Ok(())
    }

    async fn ack(&self, lane: &str, task_id: &str) -> Result<()> {
        self.reserved
            .lock()
            .unwrap()
            .entry(lane.to_string())
            .or_default()
            .remove(task_id);
        Ok(())
    }
}

/// In-memory `FenceStore`, mirroring Redis semantics (string payload +
/// presence-only active key + integer-or-absent generator_complete + a
/// taskset of member ids) closely enough to exercise the validator and
/// monitor logic.
#[derive(Default)]
pub struct FakeFenceStore {
    fences: Mutex<HashMap<i64, String>>,
    active: Mutex<HashSet<i64>>,
    generator_complete: Mutex<HashMap<i64, i64>>,
    taskset: Mutex<HashMap<i64, HashSet<String>>>,
    active_fences: Mutex<HashSet<String>>,
    stop: Mutex<HashSet<i64>>,
    validate_fences_blocked: Mutex<bool>,
}

impl FakeFenceStore {
    pub fn add_taskset_member(&self, ccp_id: i64, member: &str) {
        self.taskset
            .lock()
            .unwrap()
            .entry(ccp_id)
            .or_default()
            .insert(member.to_string());
    }

    /// Sets a raw (possibly malformed) payload without registering the key
    /// in the `active_fences` index, to exercise validator/monitor
    /// "un-indexed fence" and "schema mismatch" paths directly.
    pub fn set_raw_payload(&self, ccp_id: i64, raw: &str) {
        self.fences.lock().unwrap().insert(ccp_id, raw.to_string());
    }

    /// Registers `permissionsync_fence:<ccp_id>` in the `active_fences`
    /// index without requiring a well-formed payload to exist.
    pub fn index_as_active(&self, ccp_id: i64) {
        self.active_fences
            .lock()
            .unwrap()
            .insert(crate::fence::fence_key(ccp_id));
    }
}

#[async_trait]
impl FenceStore for FakeFenceStore {
    async fn fenced(&self, ccp_id: i64) -> Result<bool> {
        Ok(self.fences.lock().unwrap().contains_key(&ccp_id))
    }

    async fn payload(&self, ccp_id: i64) -> Result<Option<FencePayload>> {
        let guard = self.fences.lock().unwrap();
        match guard.get(&ccp_id) {
            None => Ok(None),
            Some(raw) => {
                let payload: FencePayload = serde_json::from_str(raw).map_err(|source| {
                    crate::error::Error::SchemaMismatch {
                        key: format!("permissionsync_fence:{ccp_id}"),
                        source,
                    }
                })?;
                Ok(Some(payload))
            }
        }
    }

    async fn set_fence(&self, ccp_id: i64, payload: Option<FencePayload>) -> Result<()> {
        match payload {
            Some(p) => {
                let encoded = serde_json::to_string(&p).unwrap();
                self.fences.lock().unwrap().insert(ccp_id, encoded);
                self.active_fences
                    .lock()
                    .unwrap()
                    .insert(crate::fence::fence_key(ccp_id));
            }
            None => {
                self.fences.lock().unwrap().remove(&ccp_id);
                self.generator_complete.lock().unwrap().remove(&ccp_id);
                self.taskset.lock().unwrap().remove(&ccp_id);
                self.active_fences
                    .lock()
                    .unwrap()
                    .remove(&crate::fence::fence_key(ccp_id));
            }
        }
        Ok(())
    }

    async fn set_active(&self, ccp_id: i64) -> Result<()> {
        self.active.lock().unwrap().insert(ccp_id);
        Ok(())
    }

    async fn active(&self, ccp_id: i64) -> Result<bool> {
        Ok(self.active.lock().unwrap().contains(&ccp_id))
    }

    async fn generator_complete(&self, ccp_id: i64) -> Result<Option<i64>> {
        Ok(self.generator_complete.lock().unwrap().get(&ccp_id).copied())
    }

    async fn set_generator_complete(&self, ccp_id: i64, total: i64) -> Result<()> {
        self.generator_complete.lock().unwrap().insert(ccp_id, total);
        Ok(())
    }

    async fn generator_clear(&self, ccp_id: i64) -> Result<()> {
        self.generator_complete.lock().unwrap().remove(&ccp_id);
        Ok(())
    }

    async fn taskset_clear(&self, ccp_id: i64) -> Result<()> {
        self.taskset.lock().unwrap().remove(&ccp_id);
        Ok(())
    }

    async fn get_remaining(&self, ccp_id: i64) -> Result<i64> {
        Ok(self
            .taskset
            .lock()
            .unwrap()
            .get(&ccp_id)
            .map(|s| s.len())
            .unwrap_or(0) as i64)
    }

    async fn taskset_members(&self, ccp_id: i64) -> Result<HashSet<String>> {
        Ok(self
            .taskset
            .lock()
            .unwrap()
            .get(&ccp_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn reset(&self, ccp_id: i64) -> Result<()> {
        self.fences.lock().unwrap().remove(&ccp_id);
        self.active.lock().unwrap().remove(&ccp_id);
        self.generator_complete.lock().unwrap().remove(&ccp_id);
        self.taskset.lock().unwrap().remove(&ccp_id);
        self.active_fences
            .lock()
            .unwrap()
            .remove(&crate::fence::fence_key(ccp_id));
        Ok(())
    }

    async fn active_fence_keys(&self) -> Result<HashSet<String>> {
        Ok(self.active_fences.lock().unwrap().clone())
    }

    async fn stop_requested(&self, ccp_id: i64) -> Result<bool> {
        Ok(self.stop.lock().unwrap().contains(&ccp_id))
    }

    async fn set_stop_requested(&self, ccp_id: i64, requested: bool) -> Result<()> {
        let mut stop = self.stop.lock().unwrap();
        if requested {
            stop.insert(ccp_id);
        } else {
            stop.remove(&ccp_id);
        }
        Ok(())
    }

    async fn validate_fences_blocked(&self) -> Result<bool> {
        Ok(*self.validate_fences_blocked.lock().unwrap())
    }

    async fn set_validate_fences_blocked(&self, _ttl_secs: i64) -> Result<()> {
        *self.validate_fences_blocked.lock().unwrap() = true;
        Ok(())
    }

    async fn remove_from_active_index(&self, key: &str) -> Result<()> {
        self.active_fences.lock().unwrap().remove(key);
        Ok(())
    }
}

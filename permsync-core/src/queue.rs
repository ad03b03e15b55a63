//! Task Queue abstraction (spec.md §2 table, "Task Queue" row; §6 "Task
//! queues"). The real broker (Celery, in the original) is out of scope —
//! only the interface the Fence Validator needs is modeled: whether a task
//! id is queued, reserved (prefetched-but-unacked), or how long a lane is.
//!
//! `RedisListTaskQueue` is a minimal stand-in good enough to drive
//! `permsync-core::validator`'s inspection logic without depending on an
//! actual Celery-compatible broker, grounded in the same
//! `ConnectionManager`-based style as `permsync-core::fence`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::Result;

/// The generator lane (spec.md §6): one task per CCP sync attempt.
pub const CONNECTOR_DOC_PERMISSIONS_SYNC: &str = "connector_doc_permissions_sync";

/// The upsert lane (spec.md §6): optional per-document fan-out, inspected
/// for length/membership by the validator.
pub const DOC_PERMISSIONS_UPSERT: &str = "doc_permissions_upsert";

fn queued_key(lane: &str) -> String {
    format!("queue:{lane}:queued")
}

fn reserved_key(lane: &str) -> String {
    format!("queue:{lane}:reserved")
}

/// Priority lanes a task can be enqueued with (spec.md §4.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// The subset of broker behavior the Fence Validator and Beat Scheduler
/// need: enqueue a task, and inspect queued/reserved ids and queue length.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task with a caller-chosen id, returning that same id (the
    /// original returns the broker-assigned id; here the caller always
    /// supplies a deterministic custom id per spec.md §4.2.2).
    async fn enqueue(&self, lane: &str, task_id: &str, priority: Priority) -> Result<String>;

    /// All task ids currently sitting in the lane's queue.
    async fn queued_task_ids(&self, lane: &str) -> Result<std::collections::HashSet<String>>;

    /// All task ids prefetched by a worker but not yet acknowledged.
    async fn reserved_task_ids(&self, lane: &str) -> Result<std::collections::HashSet<String>>;

    /// Number of tasks currently queued in the lane.
    async fn queue_len(&self, lane: &str) -> Result<i64>;

    /// Whether a specific task id is present in the lane's queue.
    async fn find_task(&self, lane: &str, task_id: &str) -> Result<bool> {
        Ok(self.queued_task_ids(lane).await?.contains(task_id))
    }

    /// Move a task id from queued to reserved (a worker dequeued it but
    /// has not acked it yet).
    async fn reserve(&self, lane: &str, task_id: &str) -> Result<()>;

    /// Acknowledge (remove) a reserved task id once it has finished.
    async fn ack(&self, lane: &str, task_id: &str) -> Result<()>;
}

/// Redis-backed `TaskQueue`: a list for FIFO ordering plus a set mirror for
/// O(1) membership checks, and a second set for reserved ids.
#[derive(Clone)]
pub struct RedisListTaskQueue {
    conn: ConnectionManager,
}

impl RedisListTaskQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl TaskQueue for RedisListTaskQueue {
    async fn enqueue(&self, lane: &str, task_id: &str, priority: Priority) -> Result<String> {
        let mut conn = self.conn();
        // Higher priority tasks are pushed to the front so a simple LPOP
        // consumer drains them first; ties keep FIFO order via RPUSH.
        match priority {
            Priority::High => {
                conn.lpush(queued_key(lane), task_id).await?;
            }
            Priority::Medium | Priority::Low => {
                conn.rpush(queued_key(lane), task_id).await?;
            }
        }
        conn.sadd(format!("{}:ids", queued_key(lane)), task_id)
            .await?;
        Ok(task_id.to_string())
    }

    async fn queued_task_ids(&self, lane: &str) -> Result<std::collections::HashSet<String>> {
        let mut conn = self.conn();
        let ids: std::collections::HashSet<String> =
            conn.smembers(format!("{}:ids", queued_key(lane))).await?;
        Ok(ids)
    }

    async fn reserved_task_ids(&self, lane: &str) -> Result<std::collections::HashSet<String>> {
        let mut conn = self.conn();
        let ids: std::collections::HashSet<String> = conn.smembers(reserved_key(lane)).await?;
        Ok(ids)
    }

    async fn queue_len(&self, lane: &str) -> Result<i64> {
        let mut conn = self.conn();
        let len: i64 = conn.llen(queued_key(lane)).await?;
        Ok(len)
    }

    async fn reserve(&self, lane: &str, task_id: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.srem(format!("{}:ids", queued_key(lane)), task_id)
            .await?;
        conn.lrem(queued_key(lane), 1, task_id).await?;
        conn.sadd(reserved_key(lane), task_id).await?;
        Ok(())
    }

    async fn ack(&self, lane: &str, task_id: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.srem(reserved_key(lane), task_id).await?;
        Ok(())
    }
}

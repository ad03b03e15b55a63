//! Data model shared by the Beat Scheduler, Generator Worker, ACL Upserter,
//! Fence Validator and Progress Monitor.
//!
//! Field shapes are grounded in
//! `examples/original_source/backend/ee/onyx/background/celery/tasks/doc_permission_syncing/tasks.py`;
//! the Diesel model layout (`Insertable`/`Queryable`/`AsChangeset` triad)
//! follows `delicate-scheduler/src/db/mysql/model/task_log.rs`.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A SaaS source a connector can be configured against.
///
/// Only the tag is modeled here: the per-source ACL-fetching logic is
/// delegated to a pluggable callable and is explicitly out of scope
/// (spec.md §1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentSource {
    Slack,
    GoogleDrive,
    Confluence,
    Github,
    Other(String),
}

impl fmt::Display for DocumentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentSource::Slack => write!(f, "slack"),
            DocumentSource::GoogleDrive => write!(f, "google_drive"),
            DocumentSource::Confluence => write!(f, "confluence"),
            DocumentSource::Github => write!(f, "github"),
            DocumentSource::Other(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for DocumentSource {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "slack" => DocumentSource::Slack,
            "google_drive" => DocumentSource::GoogleDrive,
            "confluence" => DocumentSource::Confluence,
            "github" => DocumentSource::Github,
            other => DocumentSource::Other(other.to_string()),
        })
    }
}

/// Whether a CCP's permissions are synced automatically, never, or always
/// public. Only `Sync` participates in this subsystem (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    Sync,
    Private,
    Public,
}

/// Lifecycle status of a connector-credential pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorCredentialPairStatus {
    Active,
    Paused,
    Deleted,
}

/// A Connector-Credential Pair: binds a source connector configuration to a
/// credential used to authenticate against that source (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorCredentialPair {
    pub id: i64,
    pub connector_id: i64,
    pub credential_id: i64,
    pub source: DocumentSource,
    pub access_type: AccessType,
    pub status: ConnectorCredentialPairStatus,
    pub last_successful_index_time: Option<DateTime<Utc>>,
    pub last_time_perm_sync: Option<DateTime<Utc>>,
}

/// Resolved per-source sync configuration (spec.md §3).
///
/// `doc_sync_func` is a type-erased pull-based iterator factory: given the
/// CCP and the two fetch callbacks, it returns a finite, non-restartable
/// sequence of `DocExternalAccess` records (spec.md §4.3 step 7, and the
/// design note in spec.md §9 "model as a pull-based finite iterator").
pub struct SourceSyncConfig {
    pub doc_sync_frequency_secs: i64,
    pub initial_index_should_sync: bool,
    pub doc_sync_config: Option<DocSyncFunc>,
    pub censoring_config: Option<CensoringConfig>,
}

impl fmt::Debug for SourceSyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceSyncConfig")
            .field("doc_sync_frequency_secs", &self.doc_sync_frequency_secs)
            .field(
                "initial_index_should_sync",
                &self.initial_index_should_sync,
            )
            .field("doc_sync_config", &self.doc_sync_config.is_some())
            .field("censoring_config", &self.censoring_config.is_some())
            .finish()
    }
}

/// Marker that a source is censoring-only: if present and `doc_sync_config`
/// is absent, the generator returns success without emitting any work
/// (spec.md §3, §4.3 step 5).
#[derive(Debug, Clone)]
pub struct CensoringConfig;

/// Sort order passed to `fetch_all_docs_fn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// A minimal projection of an already-indexed document, as returned by
/// `fetch_all_docs_fn`. `doc_sync_func` implementations use this (plus
/// `fetch_all_doc_ids_fn`) to determine documents that are no longer
/// accessible and thus should be pruned by a connector-specific policy;
/// the policy itself is out of scope here.
#[derive(Debug, Clone)]
pub struct DocumentRow {
    pub doc_id: String,
    pub semantic_id: Option<String>,
}

/// `(cc_pair, fetch_all_docs, fetch_all_doc_ids, heartbeat) -> lazy sequence`.
///
/// The callable itself is a trait object so the registry can hold one per
/// source without a generic type parameter leaking through the whole
/// crate; callers box a closure or a richer type implementing `DocSync`.
pub type DocSyncFunc = std::sync::Arc<dyn DocSync>;

/// A per-source ACL producer. Out of scope per spec.md §1 — this trait is
/// the pluggable seam, not an implementation of any particular source.
pub trait DocSync: Send + Sync {
    /// Produce a finite, non-restartable iterator of ACL records for one
    /// CCP. The iterator is pulled by the Generator Worker in a single
    /// logical thread, interleaving heartbeat renewals between items
    /// (spec.md §4.3 step 8, §9 design note).
    fn sync(
        &self,
        cc_pair: &ConnectorCredentialPair,
        fetch_all_docs: &dyn Fn(Option<SortOrder>) -> Vec<DocumentRow>,
        fetch_all_doc_ids: &dyn Fn() -> Vec<String>,
        heartbeat: &dyn Heartbeat,
    ) -> Box<dyn Iterator<Item = DocExternalAccess> + Send>;
}

/// `validate_ccpair_for_user` (spec.md §4.3 step 4): ensures the CCP's
/// credential is still usable before a sync attempt begins. Out of scope
/// per spec.md §1 — this trait is the pluggable seam.
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, cc_pair: &ConnectorCredentialPair) -> Result<(), String>;
}

/// The heartbeat callback interface (spec.md §4.3.1) passed into
/// `doc_sync_func`.
pub trait Heartbeat: Send + Sync {
    /// True iff a CCP-scoped stop signal has been set externally.
    fn should_stop(&self) -> bool;

    /// Renew liveness and, periodically, extend the owning sync lock.
    fn progress(&self, tag: &str, amount: i64);
}

/// External access list for one document, produced by `doc_sync_func` and
/// consumed by the ACL Upserter (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocExternalAccess {
    pub doc_id: String,
    pub external_access: ExternalAccess,
}

/// The set of external principals granted access to a document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalAccess {
    pub external_user_emails: HashSet<String>,
    pub external_user_group_ids: HashSet<String>,
    pub is_public: bool,
}

/// The Redis-resident fence payload (spec.md §3 "Fence").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FencePayload {
    /// Short random id for log correlation.
    pub id: String,
    /// Timestamp the fence was created.
    pub submitted: DateTime<Utc>,
    /// Timestamp the generator actually began. Null until the generator
    /// observes the fence and starts pulling from `doc_sync_func`.
    pub started: Option<DateTime<Utc>>,
    /// Id of the generator task. Null until the enqueue call returns.
    pub celery_task_id: Option<String>,
}

/// What kind of sync a `SyncRecord` row tracks. Only `ExternalPermissions`
/// is produced by this subsystem; other variants exist only so the DB
/// contract's `SyncRecord` type is representable generically, matching the
/// original's shared table (spec.md §1 Non-goals: other sync types are not
/// implemented here).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncType {
    ExternalPermissions,
    Other(String),
}

/// Status of one sync attempt (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    InProgress,
    Success,
    Failure,
}

/// One row per sync attempt (spec.md §3 "Sync Record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: i64,
    pub ccp_id: i64,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub num_docs_synced: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

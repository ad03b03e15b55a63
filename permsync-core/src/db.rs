//! DB contracts (spec.md §6): the interface-level operations the Beat
//! Scheduler, Generator Worker, ACL Upserter and Progress Monitor use.
//!
//! Physical schema of the ACL database and user table is out of scope per
//! spec.md §1 — only the upsert contracts are specified. CCP configuration
//! itself is an external collaborator (spec.md §1 Non-goals), so reading
//! CCPs is split into its own `CcpRepository` trait rather than bundled
//! into `AclDatabase`; only `mark_cc_pair_as_permissions_synced` (a write
//! this subsystem owns per spec.md §6) lives on `AclDatabase`.
//!
//! The Diesel model layout (`Insertable`/`Queryable`/`AsChangeset` triad,
//! `#[table_name = "..."]`, boxed query builders) follows
//! `delicate-scheduler/src/db/mysql/model/task_log.rs`; the module split
//! (`db::common` for cross-backend types) follows
//! `delicate-scheduler/src/db/common/mod.rs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::MysqlConnection;

use crate::error::{Error, Result};
use crate::model::{
    AccessType, ConnectorCredentialPair, ConnectorCredentialPairStatus, DocExternalAccess,
    DocumentSource, SyncStatus, SyncType,
};

/// A pooled Diesel MySQL connection manager, matching the teacher's
/// `db::ConnectionPool` (`delicate-scheduler/src/main.rs`'s
/// `db::get_connection_pool()`).
pub type ConnectionPool = Pool<ConnectionManager<MysqlConnection>>;

pub mod schema {
    diesel::table! {
        document_external_perms (doc_id) {
            doc_id -> Varchar,
            source_type -> Varchar,
            external_user_emails -> Text,
            external_user_group_ids -> Text,
            is_public -> Bool,
        }
    }

    diesel::table! {
        document_by_connector_credential_pair (id) {
            id -> BigInt,
            connector_id -> BigInt,
            credential_id -> BigInt,
            doc_id -> Varchar,
        }
    }

    diesel::table! {
        ext_perm_user (email) {
            email -> Varchar,
        }
    }

    diesel::table! {
        sync_record (id) {
            id -> BigInt,
            ccp_id -> BigInt,
            sync_type -> Varchar,
            status -> Varchar,
            num_docs_synced -> Nullable<BigInt>,
            started_at -> Timestamp,
            ended_at -> Nullable<Timestamp>,
        }
    }

    // Only the column this subsystem is allowed to write
    // (`last_time_perm_sync`, via `mark_cc_pair_as_permissions_synced`).
    // The rest of the CCP's physical schema belongs to the out-of-scope
    // CCP configuration subsystem (spec.md §1).
    diesel::table! {
        connector_credential_pair (id) {
            id -> BigInt,
            last_time_perm_sync -> Nullable<Timestamp>,
        }
    }

    // Read-only view of the same physical table, for `CcpRepository`. Kept
    // as a distinct Diesel table binding (rather than widening the one
    // above) so the write path above stays visibly scoped to the single
    // column this subsystem owns.
    diesel::table! {
        #[sql_name = "connector_credential_pair"]
        cc_pair_reads (id) {
            id -> BigInt,
            connector_id -> BigInt,
            credential_id -> BigInt,
            source -> Varchar,
            access_type -> Varchar,
            status -> Varchar,
            auto_sync_enabled -> Bool,
            last_successful_index_time -> Nullable<Timestamp>,
            last_time_perm_sync -> Nullable<Timestamp>,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = schema::sync_record)]
struct NewSyncRecord {
    ccp_id: i64,
    sync_type: String,
    status: String,
    started_at: chrono::NaiveDateTime,
}

#[derive(AsChangeset)]
#[diesel(table_name = schema::sync_record)]
struct SyncRecordStatusUpdate {
    status: String,
    num_docs_synced: Option<i64>,
    ended_at: Option<chrono::NaiveDateTime>,
}

#[derive(AsChangeset)]
#[diesel(table_name = schema::connector_credential_pair)]
struct MarkPermissionsSynced {
    last_time_perm_sync: Option<chrono::NaiveDateTime>,
}

/// Read access to connector-credential pairs. CCP configuration is an
/// external collaborator (spec.md §1 Non-goals): this subsystem only ever
/// reads through this trait, never writes, and never owns the physical
/// schema behind it.
#[async_trait]
pub trait CcpRepository: Send + Sync {
    /// `get_all_auto_sync_cc_pairs`.
    async fn get_all_auto_sync_cc_pairs(&self) -> Result<Vec<ConnectorCredentialPair>>;

    /// `get_connector_credential_pair_from_id`.
    async fn get_connector_credential_pair_from_id(
        &self,
        id: i64,
    ) -> Result<Option<ConnectorCredentialPair>>;
}

/// The ACL-side DB contracts this subsystem owns (spec.md §6).
#[async_trait]
pub trait AclDatabase: Send + Sync {
    /// `upsert_document_external_perms`. Returns `true` if the document row
    /// is new.
    async fn upsert_document_external_perms(
        &self,
        doc: &DocExternalAccess,
        source_type: &str,
    ) -> Result<bool>;

    /// `upsert_document_by_connector_credential_pair`.
    async fn upsert_document_by_connector_credential_pair(
        &self,
        connector_id: i64,
        credential_id: i64,
        doc_ids: &[String],
    ) -> Result<()>;

    /// `batch_add_ext_perm_user_if_not_exists`, `continue_on_error=true`:
    /// per-user failures are swallowed, never propagated.
    async fn batch_add_ext_perm_user_if_not_exists(&self, emails: &[String]) -> Result<()>;

    /// `insert_sync_record`.
    async fn insert_sync_record(&self, ccp_id: i64, sync_type: SyncType) -> Result<i64>;

    /// `update_sync_record_status`.
    async fn update_sync_record_status(
        &self,
        ccp_id: i64,
        sync_type: SyncType,
        status: SyncStatus,
        num_docs_synced: Option<i64>,
    ) -> Result<()>;

    /// `mark_cc_pair_as_permissions_synced`.
    async fn mark_cc_pair_as_permissions_synced(
        &self,
        ccp_id: i64,
        synced_at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Diesel/MySQL-backed implementation. Diesel's blocking API is run on
/// Tokio's blocking thread pool, the standard bridge for a sync ORM inside
/// an async call graph.
#[derive(Clone)]
pub struct DieselAclDatabase {
    pool: ConnectionPool,
}

impl DieselAclDatabase {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<PooledConnection<ConnectionManager<MysqlConnection>>> {
        self.pool.get().map_err(|e| Error::Pool(e.to_string()))
    }
}

/// Diesel/MySQL-backed `CcpRepository`. Reads only; the subsystem never
/// writes through this path.
#[derive(Clone)]
pub struct DieselCcpRepository {
    pool: ConnectionPool,
}

impl DieselCcpRepository {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<PooledConnection<ConnectionManager<MysqlConnection>>> {
        self.pool.get().map_err(|e| Error::Pool(e.to_string()))
    }
}

type CcPairRow = (
    i64,
    i64,
    i64,
    String,
    String,
    String,
    bool,
    Option<chrono::NaiveDateTime>,
    Option<chrono::NaiveDateTime>,
);

fn document_source_from_str(s: &str) -> DocumentSource {
    match s {
        "slack" => DocumentSource::Slack,
        "google_drive" => DocumentSource::GoogleDrive,
        "confluence" => DocumentSource::Confluence,
        "github" => DocumentSource::Github,
        other => DocumentSource::Other(other.to_string()),
    }
}

fn access_type_from_str(s: &str) -> AccessType {
    match s {
        "public" => AccessType::Public,
        "sync" => AccessType::Sync,
        _ => AccessType::Private,
    }
}

fn ccpair_status_from_str(s: &str) -> ConnectorCredentialPairStatus {
    match s {
        "active" => ConnectorCredentialPairStatus::Active,
        "paused" => ConnectorCredentialPairStatus::Paused,
        _ => ConnectorCredentialPairStatus::Deleted,
    }
}

fn row_to_ccpair(row: CcPairRow) -> ConnectorCredentialPair {
    let (
        id,
        connector_id,
        credential_id,
        source,
        access_type,
        status,
        _auto_sync_enabled,
        last_successful_index_time,
        last_time_perm_sync,
    ) = row;
    ConnectorCredentialPair {
        id,
        connector_id,
        credential_id,
        source: document_source_from_str(&source),
        access_type: access_type_from_str(&access_type),
        status: ccpair_status_from_str(&status),
        last_successful_index_time: last_successful_index_time
            .map(|t| DateTime::<Utc>::from_naive_utc_and_offset(t, Utc)),
        last_time_perm_sync: last_time_perm_sync
            .map(|t| DateTime::<Utc>::from_naive_utc_and_offset(t, Utc)),
    }
}

#[async_trait]
impl CcpRepository for DieselCcpRepository {
    async fn get_all_auto_sync_cc_pairs(&self) -> Result<Vec<ConnectorCredentialPair>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            use schema::cc_pair_reads::dsl;
            let mut conn = this.get_conn()?;
            let rows: Vec<CcPairRow> = dsl::cc_pair_reads
                .filter(dsl::auto_sync_enabled.eq(true))
                .filter(dsl::status.ne("deleted"))
                .select((
                    dsl::id,
                    dsl::connector_id,
                    dsl::credential_id,
                    dsl::source,
                    dsl::access_type,
                    dsl::status,
                    dsl::auto_sync_enabled,
                    dsl::last_successful_index_time,
                    dsl::last_time_perm_sync,
                ))
                .load(&mut conn)
                .map_err(Error::Database)?;
            Ok(rows.into_iter().map(row_to_ccpair).collect())
        })
        .await
        .map_err(|e| Error::Fatal(format!("blocking task panicked: {e}")))?
    }

    async fn get_connector_credential_pair_from_id(
        &self,
        id: i64,
    ) -> Result<Option<ConnectorCredentialPair>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            use schema::cc_pair_reads::dsl;
            let mut conn = this.get_conn()?;
            let row: Option<CcPairRow> = dsl::cc_pair_reads
                .filter(dsl::id.eq(id))
                .select((
                    dsl::id,
                    dsl::connector_id,
                    dsl::credential_id,
                    dsl::source,
                    dsl::access_type,
                    dsl::status,
                    dsl::auto_sync_enabled,
                    dsl::last_successful_index_time,
                    dsl::last_time_perm_sync,
                ))
                .first(&mut conn)
                .optional()
                .map_err(Error::Database)?;
            Ok(row.map(row_to_ccpair))
        })
        .await
        .map_err(|e| Error::Fatal(format!("blocking task panicked: {e}")))?
    }
}

fn sync_type_str(sync_type: &SyncType) -> String {
    match sync_type {
        SyncType::ExternalPermissions => "external_permissions".to_string(),
        SyncType::Other(s) => s.clone(),
    }
}

fn sync_status_str(status: SyncStatus) -> String {
    match status {
        SyncStatus::InProgress => "in_progress".to_string(),
        SyncStatus::Success => "success".to_string(),
        SyncStatus::Failure => "failure".to_string(),
    }
}

#[async_trait]
impl AclDatabase for DieselAclDatabase {
    async fn upsert_document_external_perms(
        &self,
        doc: &DocExternalAccess,
        source_type: &str,
    ) -> Result<bool> {
        let this = self.clone();
        let doc_id = doc.doc_id.clone();
        let emails = serde_json::to_string(&doc.external_access.external_user_emails)
            .expect("emails serialize cleanly");
        let groups = serde_json::to_string(&doc.external_access.external_user_group_ids)
            .expect("groups serialize cleanly");
        let is_public = doc.external_access.is_public;
        let source_type = source_type.to_string();

        tokio::task::spawn_blocking(move || {
            use schema::document_external_perms::dsl;
            let mut conn = this.get_conn()?;

            let existing: Option<String> = dsl::document_external_perms
                .filter(dsl::doc_id.eq(&doc_id))
                .select(dsl::doc_id)
                .first(&mut conn)
                .optional()
                .map_err(Error::Database)?;

            diesel::insert_into(dsl::document_external_perms)
                .values((
                    dsl::doc_id.eq(&doc_id),
                    dsl::source_type.eq(&source_type),
                    dsl::external_user_emails.eq(&emails),
                    dsl::external_user_group_ids.eq(&groups),
                    dsl::is_public.eq(is_public),
                ))
                .on_conflict(dsl::doc_id)
                .do_update()
                .set((
                    dsl::source_type.eq(&source_type),
                    dsl::external_user_emails.eq(&emails),
                    dsl::external_user_group_ids.eq(&groups),
                    dsl::is_public.eq(is_public),
                ))
                .execute(&mut conn)
                .map_err(Error::Database)?;

            Ok(existing.is_none())
        })
        .await
        .map_err(|e| Error::Fatal(format!("blocking task panicked: {e}")))?
    }

    async fn upsert_document_by_connector_credential_pair(
        &self,
        connector_id: i64,
        credential_id: i64,
        doc_ids: &[String],
    ) -> Result<()> {
        let this = self.clone();
        let doc_ids = doc_ids.to_vec();
        tokio::task::spawn_blocking(move || {
            use schema::document_by_connector_credential_pair::dsl;
            let mut conn = this.get_conn()?;
            for doc_id in doc_ids {
                let exists: bool = diesel::select(diesel::dsl::exists(
                    dsl::document_by_connector_credential_pair
                        .filter(dsl::connector_id.eq(connector_id))
                        .filter(dsl::credential_id.eq(credential_id))
                        .filter(dsl::doc_id.eq(&doc_id)),
                ))
                .get_result(&mut conn)
                .map_err(Error::Database)?;

                if !exists {
                    diesel::insert_into(dsl::document_by_connector_credential_pair)
                        .values((
                            dsl::connector_id.eq(connector_id),
                            dsl::credential_id.eq(credential_id),
                            dsl::doc_id.eq(&doc_id),
                        ))
                        .execute(&mut conn)
                        .map_err(Error::Database)?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Fatal(format!("blocking task panicked: {e}")))?
    }

    async fn batch_add_ext_perm_user_if_not_exists(&self, emails: &[String]) -> Result<()> {
        let this = self.clone();
        let emails = emails.to_vec();
        tokio::task::spawn_blocking(move || {
            use schema::ext_perm_user::dsl;
            let mut conn = this.get_conn()?;
            for email in emails {
                // continue_on_error=true: a single bad row never aborts the
                // batch (spec.md §4.4 step 1).
                if let Err(e) = diesel::insert_into(dsl::ext_perm_user)
                    .values(dsl::email.eq(&email))
                    .on_conflict(dsl::email)
                    .do_nothing()
                    .execute(&mut conn)
                {
                    tracing::warn!(email = %email, error = %e, "batch_add_ext_perm_user_if_not_exists: per-user insert failed, continuing");
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Fatal(format!("blocking task panicked: {e}")))?
    }

    async fn insert_sync_record(&self, ccp_id: i64, sync_type: SyncType) -> Result<i64> {
        let this = self.clone();
        let sync_type = sync_type_str(&sync_type);
        tokio::task::spawn_blocking(move || {
            use schema::sync_record::dsl;
            let mut conn = this.get_conn()?;
            let new_record = NewSyncRecord {
                ccp_id,
                sync_type,
                status: sync_status_str(SyncStatus::InProgress),
                started_at: Utc::now().naive_utc(),
            };
            diesel::insert_into(dsl::sync_record)
                .values(&new_record)
                .execute(&mut conn)
                .map_err(Error::Database)?;

            let id: i64 = dsl::sync_record
                .select(dsl::id)
                .order(dsl::id.desc())
                .first(&mut conn)
                .unwrap_or(0);
            Ok(id)
        })
        .await
        .map_err(|e| Error::Fatal(format!("blocking task panicked: {e}")))?
    }

    async fn update_sync_record_status(
        &self,
        ccp_id: i64,
        sync_type: SyncType,
        status: SyncStatus,
        num_docs_synced: Option<i64>,
    ) -> Result<()> {
        let this = self.clone();
        let sync_type = sync_type_str(&sync_type);
        tokio::task::spawn_blocking(move || {
            use schema::sync_record::dsl;
            let mut conn = this.get_conn()?;
            let update = SyncRecordStatusUpdate {
                status: sync_status_str(status),
                num_docs_synced,
                ended_at: Some(Utc::now().naive_utc()),
            };
            diesel::update(
                dsl::sync_record
                    .filter(dsl::ccp_id.eq(ccp_id))
                    .filter(dsl::sync_type.eq(&sync_type)),
            )
            .set(&update)
            .execute(&mut conn)
            .map_err(Error::Database)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Fatal(format!("blocking task panicked: {e}")))?
    }

    async fn mark_cc_pair_as_permissions_synced(
        &self,
        ccp_id: i64,
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            use schema::connector_credential_pair::dsl;
            let mut conn = this.get_conn()?;
            diesel::update(dsl::connector_credential_pair.find(ccp_id))
                .set(&MarkPermissionsSynced {
                    last_time_perm_sync: Some(synced_at.naive_utc()),
                })
                .execute(&mut conn)
                .map_err(Error::Database)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Fatal(format!("blocking task panicked: {e}")))?
    }
}

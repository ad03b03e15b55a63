//! ACL Upserter (spec.md §4.4), grounded on
//! `tasks.py::document_update_permissions` and its retry wrapper. Backoff
//! policy follows `delicate-scheduler`'s use of the `backoff` crate for
//! bounded exponential retry around transient failures.

use std::time::Duration;

use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;

use crate::db::AclDatabase;
use crate::error::{Error, Result};
use crate::model::DocExternalAccess;

/// Total elapsed budget for the retry loop (spec.md §4.4 step 2 "Stop").
const RETRY_MAX_ELAPSED: Duration = Duration::from_secs(600);
/// Initial backoff interval (spec.md §4.4 step 2 "multiplier 1 s").
const RETRY_INITIAL_INTERVAL: Duration = Duration::from_secs(1);
/// Backoff cap (spec.md §4.4 step 2 "cap 60 s").
const RETRY_MAX_INTERVAL: Duration = Duration::from_secs(60);

/// `document_update_permissions`: idempotent per-document ACL write with
/// bounded-retry on transient DB errors.
///
/// Each call is one logical transaction: batch-insert missing users,
/// upsert the document row, and — if the document row is new — associate
/// it with the owning CCP so a later deletion sync can find it.
pub async fn document_update_permissions(
    db: &dyn AclDatabase,
    doc: &DocExternalAccess,
    source_tag: &str,
    connector_id: i64,
    credential_id: i64,
) -> Result<()> {
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(RETRY_INITIAL_INTERVAL)
        .with_max_interval(RETRY_MAX_INTERVAL)
        .with_multiplier(2.0)
        .with_max_elapsed_time(Some(RETRY_MAX_ELAPSED))
        .build();

    retry(backoff, || async {
        apply_once(db, doc, source_tag, connector_id, credential_id)
            .await
            .map_err(classify)
    })
    .await
    .map_err(|e| match e {
        backoff::Error::Permanent(err) | backoff::Error::Transient { err, .. } => err,
    })
}

async fn apply_once(
    db: &dyn AclDatabase,
    doc: &DocExternalAccess,
    source_tag: &str,
    connector_id: i64,
    credential_id: i64,
) -> Result<()> {
    let emails: Vec<String> = doc
        .external_access
        .external_user_emails
        .iter()
        .cloned()
        .collect();
    // continue_on_error=true: a bad row here must never block the doc write.
    db.batch_add_ext_perm_user_if_not_exists(&emails).await?;

    let is_new = db
        .upsert_document_external_perms(doc, source_tag)
        .await?;

    if is_new {
        db.upsert_document_by_connector_credential_pair(
            connector_id,
            credential_id,
            std::slice::from_ref(&doc.doc_id),
        )
        .await?;
    }

    Ok(())
}

fn classify(err: Error) -> backoff::Error<Error> {
    if err.is_retryable() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

//! Due policy (spec.md §4.2.1), grounded line-for-line on
//! `original_source/.../tasks.py::_is_external_doc_permissions_sync_due`.

use chrono::{DateTime, Duration, Utc};

use crate::config::RuntimeConfig;
use crate::model::{AccessType, ConnectorCredentialPair, ConnectorCredentialPairStatus, SourceSyncConfig};

/// Whether `cc_pair` is due for a permissions sync right now.
///
/// All of the following must hold:
/// - `access_type == Sync` and `status == Active`.
/// - A sync config exists for its source and defines `doc_sync_config`.
/// - If `initial_index_should_sync`, `last_successful_index_time` is set.
/// - `last_time_perm_sync` is null, or enough time has elapsed since it,
///   scaled by the runtime's doc-permission-sync multiplier.
pub fn is_sync_due(
    cc_pair: &ConnectorCredentialPair,
    sync_config: Option<&SourceSyncConfig>,
    runtime: &dyn RuntimeConfig,
    now: DateTime<Utc>,
) -> bool {
    if cc_pair.access_type != AccessType::Sync {
        return false;
    }

    if cc_pair.status != ConnectorCredentialPairStatus::Active {
        return false;
    }

    let Some(sync_config) = sync_config else {
        return false;
    };

    if sync_config.doc_sync_config.is_none() {
        return false;
    }

    if sync_config.initial_index_should_sync && cc_pair.last_successful_index_time.is_none() {
        return false;
    }

    let Some(last_perm_sync) = cc_pair.last_time_perm_sync else {
        return true;
    };

    let period_secs =
        sync_config.doc_sync_frequency_secs * runtime.doc_permission_sync_multiplier().max(1);
    let next_sync = last_perm_sync + Duration::seconds(period_secs);

    now >= next_sync
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticRuntimeConfig;
    use crate::model::{CensoringConfig, DocumentSource};
    use std::sync::Arc;

    fn base_ccp() -> ConnectorCredentialPair {
        ConnectorCredentialPair {
            id: 7,
            connector_id: 1,
            credential_id: 1,
            source: DocumentSource::Slack,
            access_type: AccessType::Sync,
            status: ConnectorCredentialPairStatus::Active,
            last_successful_index_time: None,
            last_time_perm_sync: None,
        }
    }

    fn base_sync_config(initial_index_should_sync: bool) -> SourceSyncConfig {
        SourceSyncConfig {
            doc_sync_frequency_secs: 60,
            initial_index_should_sync,
            doc_sync_config: Some(Arc::new(NoopDocSync)),
            censoring_config: None,
        }
    }

    struct NoopDocSync;
    impl crate::model::DocSync for NoopDocSync {
        fn sync(
            &self,
            _cc_pair: &ConnectorCredentialPair,
            _fetch_all_docs: &dyn Fn(Option<crate::model::SortOrder>) -> Vec<crate::model::DocumentRow>,
            _fetch_all_doc_ids: &dyn Fn() -> Vec<String>,
            _heartbeat: &dyn crate::model::Heartbeat,
        ) -> Box<dyn Iterator<Item = crate::model::DocExternalAccess> + Send> {
            Box::new(std::iter::empty())
        }
    }

    #[test]
    fn never_synced_is_due_immediately() {
        let ccp = base_ccp();
        let cfg = base_sync_config(false);
        let runtime = StaticRuntimeConfig::default();
        assert!(is_sync_due(&ccp, Some(&cfg), &runtime, Utc::now()));
    }

    #[test]
    fn initial_index_required_blocks_due_until_indexed() {
        let ccp = base_ccp();
        let cfg = base_sync_config(true);
        let runtime = StaticRuntimeConfig::default();
        assert!(!is_sync_due(&ccp, Some(&cfg), &runtime, Utc::now()));
    }

    #[test]
    fn initial_index_required_is_due_once_indexed() {
        let mut ccp = base_ccp();
        ccp.last_successful_index_time = Some(Utc::now());
        let cfg = base_sync_config(true);
        let runtime = StaticRuntimeConfig::default();
        assert!(is_sync_due(&ccp, Some(&cfg), &runtime, Utc::now()));
    }

    #[test]
    fn recently_synced_is_not_due() {
        let mut ccp = base_ccp();
        ccp.last_time_perm_sync = Some(Utc::now());
        let cfg = base_sync_config(false);
        let runtime = StaticRuntimeConfig::default();
        assert!(!is_sync_due(&ccp, Some(&cfg), &runtime, Utc::now()));
    }

    #[test]
    fn sync_due_after_frequency_elapses() {
        let mut ccp = base_ccp();
        ccp.last_time_perm_sync = Some(Utc::now() - Duration::seconds(120));
        let cfg = base_sync_config(false);
        let runtime = StaticRuntimeConfig::default();
        assert!(is_sync_due(&ccp, Some(&cfg), &runtime, Utc::now()));
    }

    #[test]
    fn non_sync_access_type_never_due() {
        let mut ccp = base_ccp();
        ccp.access_type = AccessType::Private;
        let cfg = base_sync_config(false);
        let runtime = StaticRuntimeConfig::default();
        assert!(!is_sync_due(&ccp, Some(&cfg), &runtime, Utc::now()));
    }

    #[test]
    fn missing_sync_config_never_due() {
        let ccp = base_ccp();
        let runtime = StaticRuntimeConfig::default();
        assert!(!is_sync_due(&ccp, None, &runtime, Utc::now()));
    }

    #[test]
    fn censoring_only_config_never_due() {
        let ccp = base_ccp();
        let cfg = SourceSyncConfig {
            doc_sync_frequency_secs: 60,
            initial_index_should_sync: false,
            doc_sync_config: None,
            censoring_config: Some(CensoringConfig),
        };
        let runtime = StaticRuntimeConfig::default();
        assert!(!is_sync_due(&ccp, Some(&cfg), &runtime, Utc::now()));
    }
}

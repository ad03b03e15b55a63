//! Process-wide tunables and the per-source sync config registry.
//!
//! Grounded in spec.md §9's design notes: "model as an injected
//! configuration object constructed at process init; avoid ambient
//! singletons in the core" for runtime tunables, and "model as a registry
//! keyed by source-tag enum" for the per-source dispatch table.

use std::collections::HashMap;
use std::sync::RwLock;

use lazy_static::lazy_static;

use crate::model::{DocumentSource, SourceSyncConfig};

/// Beat multiplier default used when the runtime config is unavailable
/// (mirrors `CLOUD_BEAT_MULTIPLIER_DEFAULT` in the original).
pub const CLOUD_BEAT_MULTIPLIER_DEFAULT: f64 = 1.0;

/// Process-wide runtime tunables, injected rather than read from ambient
/// globals. A single implementation is constructed at process init and
/// threaded through the Beat Scheduler and Generator Worker.
pub trait RuntimeConfig: Send + Sync {
    /// Multiplier applied to `doc_sync_frequency` when evaluating due
    /// policy (spec.md §4.2.1).
    fn doc_permission_sync_multiplier(&self) -> i64;

    /// Multiplier applied to the fence-validation rate-limit TTL. Only
    /// takes effect in multi-tenant mode (spec.md §4.2 step 5); single
    /// tenant deployments should return `1.0`.
    fn beat_multiplier(&self) -> f64;

    /// Whether this process is running in multi-tenant mode.
    fn multi_tenant(&self) -> bool;
}

/// A `RuntimeConfig` with fixed values, suitable for single-tenant
/// deployments and for tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticRuntimeConfig {
    pub doc_permission_sync_multiplier: i64,
    pub beat_multiplier: f64,
    pub multi_tenant: bool,
}

impl Default for StaticRuntimeConfig {
    fn default() -> Self {
        Self {
            doc_permission_sync_multiplier: 1,
            beat_multiplier: CLOUD_BEAT_MULTIPLIER_DEFAULT,
            multi_tenant: false,
        }
    }
}

impl RuntimeConfig for StaticRuntimeConfig {
    fn doc_permission_sync_multiplier(&self) -> i64 {
        self.doc_permission_sync_multiplier
    }

    fn beat_multiplier(&self) -> f64 {
        self.beat_multiplier
    }

    fn multi_tenant(&self) -> bool {
        self.multi_tenant
    }
}

/// Registry of per-source sync configs, keyed by `DocumentSource`.
///
/// Populated at process init with whatever sources this deployment knows
/// about; per spec.md §1, the actual `doc_sync_func` implementations for
/// each source are out of scope and are registered by the embedding
/// application.
pub struct SourceSyncRegistry {
    inner: RwLock<HashMap<DocumentSource, SourceSyncConfig>>,
}

impl SourceSyncRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or overwrite) the sync config for a source.
    pub fn register(&self, source: DocumentSource, config: SourceSyncConfig) {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .insert(source, config);
    }

    /// Resolve `get_source_perm_sync_config(source)` (spec.md §4.2.1,
    /// §4.3 step 5). Returns `None` if nothing is registered for the
    /// source, which the due policy and generator both treat as "not
    /// due"/"fatal" respectively.
    pub fn get(&self, source: &DocumentSource) -> Option<std::sync::Arc<SourceSyncConfig>> {
        // Stored directly rather than behind an Arc in the map; clone out
        // the pieces callers need instead of handing back a guard.
        let guard = self.inner.read().expect("registry lock poisoned");
        guard.get(source).map(|cfg| {
            std::sync::Arc::new(SourceSyncConfig {
                doc_sync_frequency_secs: cfg.doc_sync_frequency_secs,
                initial_index_should_sync: cfg.initial_index_should_sync,
                doc_sync_config: cfg.doc_sync_config.clone(),
                censoring_config: cfg.censoring_config.clone(),
            })
        })
    }
}

impl Default for SourceSyncRegistry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// Shared process-wide registry, mirroring the teacher's use of
    /// `lazy_static` for compiled-in static tables (as opposed to
    /// request-scoped or tenant-scoped runtime tunables, which flow
    /// through `RuntimeConfig` instead).
    pub static ref GLOBAL_SOURCE_REGISTRY: SourceSyncRegistry = SourceSyncRegistry::new();
}

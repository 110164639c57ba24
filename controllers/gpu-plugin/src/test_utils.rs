//! Test utilities for unit testing the reconciler
//!
//! Builders for `GpuDevicePlugin` fixtures and a reconciler wired to the
//! in-memory store with fast retry timings.

use crate::backoff::RetryConfig;
use crate::config::Settings;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crds::{CURRENT_SCHEMA_GENERATION, GpuDevicePlugin, GpuDevicePluginSpec, SCHEMA_GENERATION_ANNOTATION};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use workload_store::MockWorkloadStore;

/// Namespace plugin DaemonSets are created in during tests
pub const TEST_NAMESPACE: &str = "inteldeviceplugins-system";

/// Resource name used by most tests
pub const TEST_PLUGIN: &str = "gpudeviceplugin-test";

/// Spec with every field set to a non-default value
pub fn test_spec() -> GpuDevicePluginSpec {
    GpuDevicePluginSpec {
        image: "gpu-testimage".to_string(),
        init_image: "gpu-testinitimage".to_string(),
        node_selector: BTreeMap::from([("gpu-nodeselector".to_string(), "true".to_string())]),
        log_level: 2,
        shared_dev_num: 42,
        ..Default::default()
    }
}

/// Resource at the current schema generation
pub fn gpu_plugin(name: &str, spec: GpuDevicePluginSpec) -> GpuDevicePlugin {
    let mut plugin = GpuDevicePlugin::new(name, spec);
    plugin.metadata.annotations = Some(BTreeMap::from([(
        SCHEMA_GENERATION_ANNOTATION.to_string(),
        CURRENT_SCHEMA_GENERATION.to_string(),
    )]));
    plugin
}

/// Resource without the schema generation annotation
pub fn legacy_plugin(name: &str, spec: GpuDevicePluginSpec) -> GpuDevicePlugin {
    GpuDevicePlugin::new(name, spec)
}

/// Settings with a low degraded threshold
pub fn test_settings() -> Settings {
    Settings {
        plugin_namespace: TEST_NAMESPACE.to_string(),
        max_transient_retries: 2,
        ..Default::default()
    }
}

/// Retry policy that keeps status conflict tests fast
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
    }
}

/// Empty store in the test namespace
pub fn test_store() -> MockWorkloadStore {
    MockWorkloadStore::new(TEST_NAMESPACE)
}

/// Reconciler writing through a clone of `store`
pub fn reconciler_with(store: &MockWorkloadStore) -> Reconciler {
    let metrics = Arc::new(Metrics::new().expect("metrics registry"));
    Reconciler::new(Box::new(store.clone()), &test_settings(), metrics).with_status_retry(fast_retry())
}

/// Reconcile `name` from its current snapshot, or from a bare one when the
/// resource is already gone.
pub async fn reconcile(
    reconciler: &Reconciler,
    store: &MockWorkloadStore,
    name: &str,
) -> Result<ReconcileOutcome, ControllerError> {
    let snapshot = store
        .plugin(name)
        .unwrap_or_else(|| GpuDevicePlugin::new(name, GpuDevicePluginSpec::default()));
    reconciler.reconcile_plugin(Arc::new(snapshot)).await
}

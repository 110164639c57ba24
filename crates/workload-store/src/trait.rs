//! WorkloadStore trait for mocking
//!
//! This trait abstracts the orchestration store so the reconciler can be
//! driven against an in-memory implementation in unit tests.

use crate::error::StoreError;
use crate::patch::WorkloadPatch;
use crds::{GpuDevicePlugin, GpuDevicePluginStatus};
use k8s_openapi::api::apps::v1::DaemonSet;

/// Orchestration store operations used by the reconciler
///
/// Writes that take a `resource_version` fail with [`StoreError::Conflict`]
/// when the stored object no longer has that version.
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait WorkloadStore: Send + Sync {
    /// Namespace the owned DaemonSets live in
    fn namespace(&self) -> &str;

    // Device plugin resources
    async fn get_plugin(&self, name: &str) -> Result<Option<GpuDevicePlugin>, StoreError>;
    async fn replace_plugin(&self, plugin: &GpuDevicePlugin) -> Result<GpuDevicePlugin, StoreError>;
    async fn patch_plugin_status(&self, name: &str, resource_version: Option<&str>, status: &GpuDevicePluginStatus) -> Result<GpuDevicePlugin, StoreError>;

    // Owned workloads
    async fn get_workload(&self, name: &str) -> Result<Option<DaemonSet>, StoreError>;
    async fn create_workload(&self, workload: &DaemonSet) -> Result<DaemonSet, StoreError>;
    async fn patch_workload(&self, name: &str, resource_version: Option<&str>, patch: &WorkloadPatch) -> Result<DaemonSet, StoreError>;
}

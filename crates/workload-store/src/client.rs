//! Kubernetes-backed store
//!
//! Talks to the API server through kube-rs. `GpuDevicePlugin` is cluster
//! scoped; DaemonSets live in the operator's plugin namespace.

use crate::error::StoreError;
use crate::patch::WorkloadPatch;
use crate::store_trait::WorkloadStore;
use crds::{GpuDevicePlugin, GpuDevicePluginStatus};
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

/// Store implementation backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeWorkloadStore {
    plugins: Api<GpuDevicePlugin>,
    workloads: Api<DaemonSet>,
    namespace: String,
}

impl std::fmt::Debug for KubeWorkloadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeWorkloadStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeWorkloadStore {
    /// Create a store for DaemonSets in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            plugins: Api::all(client.clone()),
            workloads: Api::namespaced(client, &namespace),
            namespace,
        }
    }

    /// API handle for plugin resources (used by the watcher)
    #[must_use]
    pub fn plugin_api(&self) -> Api<GpuDevicePlugin> {
        self.plugins.clone()
    }

    /// API handle for owned DaemonSets (used by the watcher)
    #[must_use]
    pub fn workload_api(&self) -> Api<DaemonSet> {
        self.workloads.clone()
    }

    /// Verify both resource types can be listed.
    ///
    /// Fails when the CRD is not installed or RBAC forbids access, which
    /// would make establishing a watch impossible.
    pub async fn check_access(&self) -> Result<(), StoreError> {
        let lp = ListParams::default().limit(1);
        self.plugins.list(&lp).await?;
        self.workloads.list(&lp).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl WorkloadStore for KubeWorkloadStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_plugin(&self, name: &str) -> Result<Option<GpuDevicePlugin>, StoreError> {
        debug!("GET GpuDevicePlugin {}", name);
        Ok(self.plugins.get_opt(name).await?)
    }

    async fn replace_plugin(&self, plugin: &GpuDevicePlugin) -> Result<GpuDevicePlugin, StoreError> {
        let name = plugin
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| StoreError::Api("GpuDevicePlugin missing name".to_string()))?;
        debug!("PUT GpuDevicePlugin {}", name);
        Ok(self.plugins.replace(name, &PostParams::default(), plugin).await?)
    }

    async fn patch_plugin_status(
        &self,
        name: &str,
        resource_version: Option<&str>,
        status: &GpuDevicePluginStatus,
    ) -> Result<GpuDevicePlugin, StoreError> {
        let mut body = serde_json::json!({ "status": serde_json::to_value(status)? });
        if let Some(rv) = resource_version {
            body["metadata"] = serde_json::json!({ "resourceVersion": rv });
        }
        debug!("PATCH GpuDevicePlugin {} status", name);
        Ok(self
            .plugins
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await?)
    }

    async fn get_workload(&self, name: &str) -> Result<Option<DaemonSet>, StoreError> {
        debug!("GET DaemonSet {}/{}", self.namespace, name);
        Ok(self.workloads.get_opt(name).await?)
    }

    async fn create_workload(&self, workload: &DaemonSet) -> Result<DaemonSet, StoreError> {
        debug!(
            "POST DaemonSet {}/{}",
            self.namespace,
            workload.metadata.name.as_deref().unwrap_or_default()
        );
        Ok(self.workloads.create(&PostParams::default(), workload).await?)
    }

    async fn patch_workload(
        &self,
        name: &str,
        resource_version: Option<&str>,
        patch: &WorkloadPatch,
    ) -> Result<DaemonSet, StoreError> {
        let body = patch.to_strategic_merge(resource_version)?;
        debug!("PATCH DaemonSet {}/{} with body: {}", self.namespace, name, body);
        Ok(self
            .workloads
            .patch(name, &PatchParams::default(), &Patch::Strategic(&body))
            .await?)
    }
}

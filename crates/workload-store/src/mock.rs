//! In-memory WorkloadStore for unit testing
//!
//! Behaves like a small API server: every write bumps a resource version,
//! writes carrying a stale version are rejected with a conflict, and deleting
//! a plugin cascades to the DaemonSets it owns the way garbage collection
//! would. Failures can be injected to exercise retry paths.

use crate::error::StoreError;
use crate::patch::WorkloadPatch;
use crate::store_trait::WorkloadStore;
use crds::{GpuDevicePlugin, GpuDevicePluginSpec, GpuDevicePluginStatus};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MockState {
    plugins: HashMap<String, GpuDevicePlugin>,
    workloads: HashMap<String, DaemonSet>,
    next_resource_version: u64,
    workload_writes: usize,
    status_writes: usize,
    plugin_writes: usize,
    injected_workload_conflicts: usize,
    injected_status_conflicts: usize,
    injected_transient_failures: usize,
}

impl MockState {
    fn bump(&mut self, meta: &mut ObjectMeta) {
        self.next_resource_version += 1;
        meta.resource_version = Some(self.next_resource_version.to_string());
    }

    fn take_transient(&mut self) -> Result<(), StoreError> {
        if self.injected_transient_failures > 0 {
            self.injected_transient_failures -= 1;
            return Err(StoreError::Transient("injected: connection refused".to_string()));
        }
        Ok(())
    }
}

fn check_version(kind: &str, name: &str, stored: &ObjectMeta, expected: Option<&str>) -> Result<(), StoreError> {
    match expected {
        Some(rv) if stored.resource_version.as_deref() != Some(rv) => Err(StoreError::Conflict(format!(
            "{kind} {name}: resource version {rv} is stale (current {})",
            stored.resource_version.as_deref().unwrap_or_default()
        ))),
        _ => Ok(()),
    }
}

/// Mock store for testing
///
/// Cloning shares the underlying state, so a test can keep a handle for
/// inspection while the reconciler owns another.
#[derive(Debug, Clone)]
pub struct MockWorkloadStore {
    namespace: String,
    state: Arc<Mutex<MockState>>,
}

impl MockWorkloadStore {
    /// Create an empty store whose DaemonSets live in `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a plugin resource (for test setup).
    ///
    /// Assigns a UID, a resource version and generation 1 unless already set.
    pub fn add_plugin(&self, mut plugin: GpuDevicePlugin) -> GpuDevicePlugin {
        let mut state = self.lock();
        if plugin.metadata.uid.is_none() {
            plugin.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        if plugin.metadata.generation.is_none() {
            plugin.metadata.generation = Some(1);
        }
        state.bump(&mut plugin.metadata);
        let name = plugin.metadata.name.clone().unwrap_or_default();
        state.plugins.insert(name, plugin.clone());
        plugin
    }

    /// Edit a plugin's spec the way `kubectl edit` would.
    pub fn update_plugin_spec(
        &self,
        name: &str,
        edit: impl FnOnce(&mut GpuDevicePluginSpec),
    ) -> Option<GpuDevicePlugin> {
        let mut state = self.lock();
        let mut plugin = state.plugins.get(name)?.clone();
        edit(&mut plugin.spec);
        plugin.metadata.generation = Some(plugin.metadata.generation.unwrap_or(0) + 1);
        state.bump(&mut plugin.metadata);
        state.plugins.insert(name.to_string(), plugin.clone());
        Some(plugin)
    }

    /// Set a deletion timestamp on a plugin, as a pending delete would.
    pub fn mark_plugin_deleting(&self, name: &str) {
        let mut state = self.lock();
        let Some(mut plugin) = state.plugins.get(name).cloned() else {
            return;
        };
        plugin.metadata.deletion_timestamp =
            serde_json::from_value::<Time>(serde_json::json!("2026-01-01T00:00:00Z")).ok();
        state.bump(&mut plugin.metadata);
        state.plugins.insert(name.to_string(), plugin);
    }

    /// Delete a plugin and garbage collect the DaemonSets it owns.
    pub fn delete_plugin(&self, name: &str) -> Option<GpuDevicePlugin> {
        let mut state = self.lock();
        let plugin = state.plugins.remove(name)?;
        if let Some(uid) = plugin.metadata.uid.as_deref() {
            state.workloads.retain(|_, ds| {
                !ds.metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
            });
        }
        Some(plugin)
    }

    /// Insert a DaemonSet directly, bypassing write counters (for test setup).
    pub fn insert_workload(&self, mut workload: DaemonSet) -> DaemonSet {
        let mut state = self.lock();
        if workload.metadata.uid.is_none() {
            workload.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        workload.metadata.namespace = Some(self.namespace.clone());
        state.bump(&mut workload.metadata);
        let name = workload.metadata.name.clone().unwrap_or_default();
        state.workloads.insert(name, workload.clone());
        workload
    }

    /// Simulate the DaemonSet controller reporting rollout progress.
    pub fn set_workload_rollout(&self, name: &str, desired: i32, ready: i32) {
        let mut state = self.lock();
        let Some(mut workload) = state.workloads.get(name).cloned() else {
            return;
        };
        workload.status = Some(DaemonSetStatus {
            desired_number_scheduled: desired,
            number_ready: ready,
            current_number_scheduled: desired,
            number_misscheduled: 0,
            ..Default::default()
        });
        state.bump(&mut workload.metadata);
        state.workloads.insert(name.to_string(), workload);
    }

    /// Current copy of a plugin
    pub fn plugin(&self, name: &str) -> Option<GpuDevicePlugin> {
        self.lock().plugins.get(name).cloned()
    }

    /// Current copy of a DaemonSet
    pub fn workload(&self, name: &str) -> Option<DaemonSet> {
        self.lock().workloads.get(name).cloned()
    }

    /// Number of DaemonSets in the store
    pub fn workload_count(&self) -> usize {
        self.lock().workloads.len()
    }

    /// Successful DaemonSet creates and patches
    pub fn workload_write_count(&self) -> usize {
        self.lock().workload_writes
    }

    /// Successful status writes
    pub fn status_write_count(&self) -> usize {
        self.lock().status_writes
    }

    /// Successful plugin replaces
    pub fn plugin_write_count(&self) -> usize {
        self.lock().plugin_writes
    }

    /// Reject the next `n` DaemonSet writes with a conflict
    pub fn inject_workload_conflicts(&self, n: usize) {
        self.lock().injected_workload_conflicts = n;
    }

    /// Reject the next `n` status writes with a conflict
    pub fn inject_status_conflicts(&self, n: usize) {
        self.lock().injected_status_conflicts = n;
    }

    /// Fail the next `n` calls of any kind as unreachable
    pub fn inject_transient_failures(&self, n: usize) {
        self.lock().injected_transient_failures = n;
    }
}

#[async_trait::async_trait]
impl WorkloadStore for MockWorkloadStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_plugin(&self, name: &str) -> Result<Option<GpuDevicePlugin>, StoreError> {
        let mut state = self.lock();
        state.take_transient()?;
        Ok(state.plugins.get(name).cloned())
    }

    async fn replace_plugin(&self, plugin: &GpuDevicePlugin) -> Result<GpuDevicePlugin, StoreError> {
        let mut state = self.lock();
        state.take_transient()?;
        let name = plugin.metadata.name.clone().unwrap_or_default();
        let stored = state
            .plugins
            .get(&name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("GpuDevicePlugin {name}")))?;
        check_version("GpuDevicePlugin", &name, &stored.metadata, plugin.metadata.resource_version.as_deref())?;

        let mut updated = plugin.clone();
        // Status is only writable through the status subresource
        updated.status = stored.status.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.generation = if updated.spec == stored.spec {
            stored.metadata.generation
        } else {
            Some(stored.metadata.generation.unwrap_or(0) + 1)
        };
        state.bump(&mut updated.metadata);
        state.plugin_writes += 1;
        state.plugins.insert(name, updated.clone());
        Ok(updated)
    }

    async fn patch_plugin_status(
        &self,
        name: &str,
        resource_version: Option<&str>,
        status: &GpuDevicePluginStatus,
    ) -> Result<GpuDevicePlugin, StoreError> {
        let mut state = self.lock();
        state.take_transient()?;
        let mut plugin = state
            .plugins
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("GpuDevicePlugin {name}")))?;
        if state.injected_status_conflicts > 0 {
            state.injected_status_conflicts -= 1;
            return Err(StoreError::Conflict(format!("injected: GpuDevicePlugin {name} status")));
        }
        check_version("GpuDevicePlugin", name, &plugin.metadata, resource_version)?;

        plugin.status = Some(status.clone());
        state.bump(&mut plugin.metadata);
        state.status_writes += 1;
        state.plugins.insert(name.to_string(), plugin.clone());
        Ok(plugin)
    }

    async fn get_workload(&self, name: &str) -> Result<Option<DaemonSet>, StoreError> {
        let mut state = self.lock();
        state.take_transient()?;
        Ok(state.workloads.get(name).cloned())
    }

    async fn create_workload(&self, workload: &DaemonSet) -> Result<DaemonSet, StoreError> {
        let mut state = self.lock();
        state.take_transient()?;
        let name = workload.metadata.name.clone().unwrap_or_default();
        if state.workloads.contains_key(&name) {
            return Err(StoreError::Conflict(format!("DaemonSet {name} already exists")));
        }
        if state.injected_workload_conflicts > 0 {
            state.injected_workload_conflicts -= 1;
            return Err(StoreError::Conflict(format!("injected: DaemonSet {name}")));
        }

        let mut created = workload.clone();
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        created.metadata.namespace = Some(self.namespace.clone());
        created.metadata.generation = Some(1);
        state.bump(&mut created.metadata);
        state.workload_writes += 1;
        state.workloads.insert(name, created.clone());
        Ok(created)
    }

    async fn patch_workload(
        &self,
        name: &str,
        resource_version: Option<&str>,
        patch: &WorkloadPatch,
    ) -> Result<DaemonSet, StoreError> {
        let mut state = self.lock();
        state.take_transient()?;
        let mut workload = state
            .workloads
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("DaemonSet {name}")))?;
        if state.injected_workload_conflicts > 0 {
            state.injected_workload_conflicts -= 1;
            return Err(StoreError::Conflict(format!("injected: DaemonSet {name}")));
        }
        check_version("DaemonSet", name, &workload.metadata, resource_version)?;

        patch.apply_to(&mut workload);
        workload.metadata.generation = Some(workload.metadata.generation.unwrap_or(0) + 1);
        state.bump(&mut workload.metadata);
        state.workload_writes += 1;
        state.workloads.insert(name.to_string(), workload.clone());
        Ok(workload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn plugin(name: &str) -> GpuDevicePlugin {
        GpuDevicePlugin::new(
            name,
            GpuDevicePluginSpec {
                image: "gpu-testimage".to_string(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let store = MockWorkloadStore::new("inteldeviceplugins-system");
        let added = store.add_plugin(plugin("gpu"));
        let stale = added.metadata.resource_version.clone();
        store.update_plugin_spec("gpu", |spec| spec.log_level = 4);

        let err = store
            .patch_plugin_status("gpu", stale.as_deref(), &GpuDevicePluginStatus::default())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.status_write_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_cascades_to_owned_workloads() {
        let store = MockWorkloadStore::new("inteldeviceplugins-system");
        let added = store.add_plugin(plugin("gpu"));
        let owner_uid = added.metadata.uid.clone().unwrap_or_default();

        let mut owned = DaemonSet::default();
        owned.metadata.name = Some("intel-gpu-plugin-gpu".to_string());
        owned.metadata.owner_references = Some(vec![OwnerReference {
            uid: owner_uid,
            ..Default::default()
        }]);
        store.insert_workload(owned);

        let mut unrelated = DaemonSet::default();
        unrelated.metadata.name = Some("someone-else".to_string());
        store.insert_workload(unrelated);

        store.delete_plugin("gpu");
        assert!(store.workload("intel-gpu-plugin-gpu").is_none());
        assert!(store.workload("someone-else").is_some());
    }

    #[tokio::test]
    async fn test_injected_transient_failures_are_consumed() {
        let store = MockWorkloadStore::new("ns");
        store.inject_transient_failures(1);
        assert!(store.get_plugin("gpu").await.is_err());
        assert!(store.get_plugin("gpu").await.is_ok());
    }

    #[tokio::test]
    async fn test_create_existing_workload_conflicts() {
        let store = MockWorkloadStore::new("ns");
        let mut ds = DaemonSet::default();
        ds.metadata.name = Some("intel-gpu-plugin-gpu".to_string());
        store.create_workload(&ds).await.expect("first create");
        let err = store.create_workload(&ds).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.workload_write_count(), 1);
    }
}

//! Kubernetes resource watchers.
//!
//! Drives the reconcile loop with `kube_runtime::Controller`. Owned
//! DaemonSets are watched too, so drift or rollout progress on a workload
//! requeues the resource that controls it.

use crate::config::Settings;
use crate::error::ControllerError;
use crate::metrics::HealthState;
use crate::reconciler::Reconciler;
use crate::reconciler::builder::APP_LABEL_VALUE;
use crds::{API_VERSION, GpuDevicePlugin};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::ResourceExt;
use kube_runtime::controller::{Action, Config as ControllerConfig, Error as RuntimeError};
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::{Controller, watcher};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use workload_store::KubeWorkloadStore;

async fn reconcile(plugin: Arc<GpuDevicePlugin>, reconciler: Arc<Reconciler>) -> Result<Action, ControllerError> {
    let outcome = reconciler.reconcile_plugin(plugin).await?;
    Ok(match outcome.requeue_after() {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

fn error_policy(plugin: Arc<GpuDevicePlugin>, error: &ControllerError, reconciler: Arc<Reconciler>) -> Action {
    let name = plugin.name_any();
    let delay = reconciler.error_requeue(&name, error);
    debug!(plugin = %name, delay_ms = delay.as_millis(), "Requeueing after error");
    Action::requeue(delay)
}

/// Maps an owned DaemonSet back to the resource controlling it.
///
/// The owner is cluster scoped, so the reference carries no namespace.
fn controlling_plugin(workload: DaemonSet) -> Option<ObjectRef<GpuDevicePlugin>> {
    workload
        .metadata
        .owner_references
        .unwrap_or_default()
        .into_iter()
        .find(|r| r.controller == Some(true) && r.api_version == API_VERSION && r.kind == "GpuDevicePlugin")
        .map(|r| ObjectRef::new(&r.name))
}

/// Flips readiness once the resource cache holds the initial listing.
async fn mark_ready_when_synced(cache: Store<GpuDevicePlugin>, health: HealthState) {
    match cache.wait_until_ready().await {
        Ok(()) => {
            info!("GpuDevicePlugin cache synced");
            health.mark_ready();
        }
        Err(e) => warn!("GpuDevicePlugin cache never synced: {}", e),
    }
}

/// Watch `GpuDevicePlugin` resources until shutdown.
pub async fn watch_plugins(
    store: &KubeWorkloadStore,
    reconciler: Arc<Reconciler>,
    settings: &Settings,
    health: HealthState,
) -> Result<(), ControllerError> {
    info!(
        namespace = %settings.plugin_namespace,
        concurrency = settings.reconcile_concurrency,
        "Starting GpuDevicePlugin watcher"
    );

    // Debounce batches bursts of events (status writes, rollout updates)
    let controller_config = ControllerConfig::default()
        .debounce(settings.debounce)
        .concurrency(settings.reconcile_concurrency);
    let workload_filter = watcher::Config::default().labels(&format!("app={APP_LABEL_VALUE}"));
    let observer = Arc::clone(&reconciler);

    let controller = Controller::new(store.plugin_api(), watcher::Config::default())
        .watches(store.workload_api(), workload_filter, controlling_plugin)
        .with_config(controller_config);
    tokio::spawn(mark_ready_when_synced(controller.store(), health));

    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| {
            let observer = Arc::clone(&observer);
            async move {
                match res {
                    Ok((obj_ref, action)) => debug!(plugin = %obj_ref.name, "Reconciled, next {:?}", action),
                    Err(RuntimeError::ObjectNotFound(obj_ref)) => observer.observe_removed(&obj_ref.name),
                    Err(RuntimeError::ReconcilerFailed(e, obj_ref)) => {
                        warn!(plugin = %obj_ref.name, error = %e, "Reconciliation failed");
                    }
                    Err(e) => error!("Controller error for GpuDevicePlugin: {}", e),
                }
            }
        })
        .await;

    info!("GpuDevicePlugin watcher stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use kube_runtime::reflector;
    use std::time::Duration;

    fn workload_owned_by(api_version: &str, kind: &str, controller: bool) -> DaemonSet {
        DaemonSet {
            metadata: ObjectMeta {
                name: Some("intel-gpu-plugin-gpu".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: api_version.to_string(),
                    kind: kind.to_string(),
                    name: "gpu".to_string(),
                    uid: "uid-1".to_string(),
                    controller: Some(controller),
                    block_owner_deletion: Some(true),
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_owned_workload_maps_to_cluster_scoped_owner() {
        let obj_ref = controlling_plugin(workload_owned_by(API_VERSION, "GpuDevicePlugin", true)).expect("mapped");
        assert_eq!(obj_ref.name, "gpu");
        assert_eq!(obj_ref.namespace, None);
    }

    #[test]
    fn test_unrelated_workloads_are_ignored() {
        assert!(controlling_plugin(workload_owned_by(API_VERSION, "GpuDevicePlugin", false)).is_none());
        assert!(controlling_plugin(workload_owned_by(API_VERSION, "ReplicaSet", true)).is_none());
        assert!(controlling_plugin(workload_owned_by("example.com/v1", "GpuDevicePlugin", true)).is_none());
        assert!(controlling_plugin(DaemonSet::default()).is_none());
    }

    #[tokio::test]
    async fn test_ready_only_after_initial_listing() {
        let (cache, mut writer) = reflector::store::<GpuDevicePlugin>();
        let health = HealthState::default();
        let task = tokio::spawn(mark_ready_when_synced(cache, health.clone()));

        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitApply(GpuDevicePlugin::new("gpu", Default::default())));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!health.is_ready());

        writer.apply_watcher_event(&watcher::Event::InitDone);
        task.await.expect("join");
        assert!(health.is_ready());
    }

    #[tokio::test]
    async fn test_not_ready_when_cache_is_abandoned() {
        let (cache, writer) = reflector::store::<GpuDevicePlugin>();
        let health = HealthState::default();
        drop(writer);

        mark_ready_when_synced(cache, health.clone()).await;
        assert!(!health.is_ready());
    }
}

//! Main controller implementation.
//!
//! Wires the Kubernetes client, store, reconciler and metrics server
//! together and runs the watcher and the probe server side by side.

use crate::config::Settings;
use crate::error::ControllerError;
use crate::metrics::{self, HealthState, Metrics};
use crate::reconciler::Reconciler;
use crate::watcher;
use kube::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use workload_store::KubeWorkloadStore;

/// Main controller for GpuDevicePlugin resources.
pub struct Controller {
    plugin_watcher: JoinHandle<Result<(), ControllerError>>,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Connects to the cluster and starts the background tasks.
    pub async fn new(settings: Settings) -> Result<Self, ControllerError> {
        info!("Initializing GPU plugin controller");

        let kube_client = Client::try_default().await?;
        let store = KubeWorkloadStore::new(kube_client, settings.plugin_namespace.clone());

        info!("Checking access to GpuDevicePlugin and DaemonSet APIs...");
        store.check_access().await.map_err(|e| {
            error!("Cannot list GpuDevicePlugin or DaemonSet resources: {}", e);
            error!("Please ensure the CRD is installed and RBAC grants list/watch");
            ControllerError::Store(e)
        })?;

        let metrics = Arc::new(Metrics::new()?);
        let health = HealthState::default();
        let reconciler = Arc::new(Reconciler::new(Box::new(store.clone()), &settings, Arc::clone(&metrics)));

        let watcher_settings = settings.clone();
        let watcher_health = health.clone();
        let plugin_watcher = tokio::spawn(async move {
            watcher::watch_plugins(&store, reconciler, &watcher_settings, watcher_health).await
        });

        let bind_address = settings.metrics_bind_address;
        let metrics_server = tokio::spawn(async move { metrics::serve(bind_address, metrics, health).await });

        Ok(Self {
            plugin_watcher,
            metrics_server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("GPU plugin controller running");

        tokio::select! {
            result = &mut self.plugin_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("GpuDevicePlugin watcher panicked: {e}")))??;
            }
            result = &mut self.metrics_server => {
                result.map_err(|e| ControllerError::Watch(format!("Metrics server panicked: {e}")))??;
            }
        }

        Ok(())
    }
}

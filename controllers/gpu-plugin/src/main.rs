//! GPU Plugin Controller
//!
//! Reconciles cluster-scoped `GpuDevicePlugin` resources into Intel GPU
//! device plugin DaemonSets.
//!
//! Each resource owns exactly one DaemonSet in the plugin namespace. The
//! controller creates it, patches only the fields that drifted from the
//! spec, leaves deletion to owner-reference garbage collection and reports
//! the workload identity and rollout progress on the status subresource.

mod backoff;
mod config;
mod controller;
mod error;
mod event;
mod metrics;
mod reconciler;
mod state;
#[cfg(test)]
mod test_utils;
mod watcher;

use crate::config::Settings;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("rustls crypto provider already installed");
    }

    info!("Starting GPU Plugin Controller");

    let settings = Settings::from_env()?;
    info!("Configuration:");
    info!("  Plugin namespace: {}", settings.plugin_namespace);
    info!("  Reconcile concurrency: {}", settings.reconcile_concurrency);
    info!("  Debounce: {:?}", settings.debounce);
    info!("  Degraded after: {} transient failures", settings.max_transient_retries);
    info!("  Metrics address: {}", settings.metrics_bind_address);

    let controller = Controller::new(settings).await?;
    controller.run().await?;

    Ok(())
}

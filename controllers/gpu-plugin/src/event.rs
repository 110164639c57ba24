//! Typed watch events
//!
//! The controller runtime hands us the latest object snapshot; combined with
//! what the state tracker already knows about the name, that is enough to
//! tell a create from an update, and the deletion timestamp marks deletes.

use crate::state::ReconcileState;
use crds::GpuDevicePlugin;
use std::sync::Arc;

/// A watch notification for a `GpuDevicePlugin`
#[derive(Debug, Clone)]
pub enum PluginEvent {
    /// First sighting of the resource (or of a recreated one)
    Created(Arc<GpuDevicePlugin>),
    /// Resource already known
    Updated(Arc<GpuDevicePlugin>),
    /// Resource carries a deletion timestamp
    Deleted(Arc<GpuDevicePlugin>),
}

impl PluginEvent {
    /// Classify a snapshot given the tracker's state for its name.
    #[must_use]
    pub fn classify(plugin: Arc<GpuDevicePlugin>, known: Option<ReconcileState>) -> Self {
        if plugin.metadata.deletion_timestamp.is_some() {
            return PluginEvent::Deleted(plugin);
        }
        match known {
            None | Some(ReconcileState::Gone) => PluginEvent::Created(plugin),
            Some(_) => PluginEvent::Updated(plugin),
        }
    }

    /// Snapshot carried by the event
    #[must_use]
    pub fn plugin(&self) -> &GpuDevicePlugin {
        match self {
            PluginEvent::Created(p) | PluginEvent::Updated(p) | PluginEvent::Deleted(p) => p,
        }
    }

    /// Event kind for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            PluginEvent::Created(_) => "created",
            PluginEvent::Updated(_) => "updated",
            PluginEvent::Deleted(_) => "deleted",
        }
    }
}

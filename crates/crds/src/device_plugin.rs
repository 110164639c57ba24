//! Shared device plugin resource conventions
//!
//! Every device plugin kind owns exactly one DaemonSet whose name is derived
//! from the resource name, so lookups are computed rather than searched.
//! Resources also carry a schema generation marker used to detect objects
//! written by an older operator.

use kube::Resource;
use thiserror::Error;

/// API version of the device plugin resources
pub const API_VERSION: &str = "deviceplugin.intel.com/v1";

/// Annotation holding the schema generation a resource was last written with
pub const SCHEMA_GENERATION_ANNOTATION: &str = "deviceplugin.intel.com/schema-generation";

/// Generation assumed for resources without the annotation
pub const LEGACY_SCHEMA_GENERATION: u32 = 1;

/// Generation written by this operator
pub const CURRENT_SCHEMA_GENERATION: u32 = 2;

/// Schema generation annotation could not be interpreted
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid schema generation annotation {value:?}: {reason}")]
pub struct SchemaGenerationError {
    /// Raw annotation value
    pub value: String,
    /// Why it was rejected
    pub reason: String,
}

/// Conventions shared by device plugin custom resources.
pub trait DevicePlugin: Resource<DynamicType = ()> {
    /// Short plugin kind used in derived names (e.g. "gpu")
    const PLUGIN_KIND: &'static str;

    /// Name of the plugin container inside the DaemonSet
    fn container_name() -> String {
        format!("intel-{}-plugin", Self::PLUGIN_KIND)
    }

    /// Derives the owned DaemonSet name for a resource name.
    fn workload_name_for(resource_name: &str) -> String {
        format!("intel-{}-plugin-{}", Self::PLUGIN_KIND, resource_name)
    }

    /// Owned DaemonSet name for this resource.
    fn workload_name(&self) -> String {
        Self::workload_name_for(self.meta().name.as_deref().unwrap_or_default())
    }

    /// Reads the schema generation marker, defaulting to the legacy generation.
    fn schema_generation(&self) -> Result<u32, SchemaGenerationError> {
        let Some(value) = self
            .meta()
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(SCHEMA_GENERATION_ANNOTATION))
        else {
            return Ok(LEGACY_SCHEMA_GENERATION);
        };

        match value.trim().parse::<u32>() {
            Ok(0) => Err(SchemaGenerationError {
                value: value.clone(),
                reason: "generations start at 1".to_string(),
            }),
            Ok(generation) => Ok(generation),
            Err(e) => Err(SchemaGenerationError {
                value: value.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

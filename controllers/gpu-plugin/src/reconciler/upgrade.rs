//! Schema generation migration
//!
//! Generation 1 resources predate `allocationPolicy` and spec defaulting:
//! the policy lived in `preferredAllocationPolicy` and `sharedDevNum` could
//! be stored as 0. Migration rewrites those into the current shape and
//! stamps the generation annotation. Every other field is carried over
//! verbatim. A resource whose legacy and current policies disagree is
//! refused rather than having either value dropped.

use crate::error::ControllerError;
use crate::reconciler::normalize;
use crds::{AllocationPolicy, CURRENT_SCHEMA_GENERATION, DevicePlugin, GpuDevicePlugin, SCHEMA_GENERATION_ANNOTATION};

/// Whether `plugin` was written under an older schema generation.
pub fn needs_migration(plugin: &GpuDevicePlugin) -> Result<bool, ControllerError> {
    let generation = plugin
        .schema_generation()
        .map_err(|e| ControllerError::InvalidResource(e.to_string()))?;
    Ok(generation < CURRENT_SCHEMA_GENERATION)
}

/// Rewrites `plugin` to the current schema generation.
///
/// Resources already at (or beyond) the current generation are returned
/// unchanged, so migrating twice is the same as migrating once.
pub fn migrate(plugin: &GpuDevicePlugin) -> Result<GpuDevicePlugin, ControllerError> {
    if !needs_migration(plugin)? {
        return Ok(plugin.clone());
    }
    normalize::check_policies(&plugin.spec)?;

    let mut migrated = plugin.clone();
    let spec = &mut migrated.spec;

    let legacy = spec.preferred_allocation_policy.take();
    if spec.allocation_policy == AllocationPolicy::None {
        spec.allocation_policy = legacy.unwrap_or_default();
    }
    if spec.shared_dev_num == 0 {
        spec.shared_dev_num = 1;
    }

    migrated
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(SCHEMA_GENERATION_ANNOTATION.to_string(), CURRENT_SCHEMA_GENERATION.to_string());

    Ok(migrated)
}

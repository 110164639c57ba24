//! Spec defaulting and validation
//!
//! [`validate`] rejects specs the plugin cannot run with; [`normalize`] is
//! total and only fills in defaults, so it is always called after a
//! successful validation.

use crds::{AllocationPolicy, GpuDevicePluginSpec, PluginToleration};
use std::collections::BTreeMap;
use thiserror::Error;

/// Node label constraining plugin pods when no selector is given
pub const ARCH_LABEL: &str = "kubernetes.io/arch";

/// Architecture the default selector targets
pub const DEFAULT_ARCH: &str = "amd64";

/// Spec violates an invariant
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// `image` is empty
    #[error("image must not be empty")]
    EmptyImage,

    /// A numeric field is below zero
    #[error("{field} must not be negative, got {value}")]
    Negative {
        /// Field name as written in the manifest
        field: &'static str,
        /// Offending value
        value: i32,
    },

    /// Legacy and current policy fields disagree
    #[error("allocationPolicy {current} conflicts with preferredAllocationPolicy {legacy}")]
    ConflictingPolicies {
        /// `allocationPolicy`
        current: &'static str,
        /// `preferredAllocationPolicy`
        legacy: &'static str,
    },

    /// Allocation policy set on a device that is not shared
    #[error("allocationPolicy {0} requires sharedDevNum greater than 1")]
    PolicyWithoutSharing(&'static str),
}

/// Spec with all defaults applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSpec {
    /// Plugin image
    pub image: String,
    /// Init image, `None` when the init stage is omitted
    pub init_image: Option<String>,
    /// Never empty
    pub node_selector: BTreeMap<String, String>,
    /// Plugin verbosity
    pub log_level: i32,
    /// At least 1
    pub shared_dev_num: i32,
    /// Effective policy after folding in the legacy field
    pub allocation_policy: AllocationPolicy,
    /// Whether `-enable-monitoring` is passed
    pub enable_monitoring: bool,
    /// Pod tolerations
    pub tolerations: Vec<PluginToleration>,
}

fn effective_policy(spec: &GpuDevicePluginSpec) -> AllocationPolicy {
    match (spec.allocation_policy, spec.preferred_allocation_policy) {
        (AllocationPolicy::None, Some(legacy)) => legacy,
        (current, _) => current,
    }
}

/// Fails when `allocationPolicy` and the legacy `preferredAllocationPolicy`
/// name different policies.
///
/// Migration folds the legacy field away, so this runs before it too.
pub fn check_policies(spec: &GpuDevicePluginSpec) -> Result<(), ValidationError> {
    match spec.preferred_allocation_policy {
        Some(legacy)
            if legacy != AllocationPolicy::None
                && spec.allocation_policy != AllocationPolicy::None
                && spec.allocation_policy != legacy =>
        {
            Err(ValidationError::ConflictingPolicies {
                current: spec.allocation_policy.as_arg(),
                legacy: legacy.as_arg(),
            })
        }
        _ => Ok(()),
    }
}

/// Rejects resource specs the builder cannot turn into a workload.
pub fn validate(spec: &GpuDevicePluginSpec) -> Result<(), ValidationError> {
    if spec.image.trim().is_empty() {
        return Err(ValidationError::EmptyImage);
    }
    if spec.log_level < 0 {
        return Err(ValidationError::Negative {
            field: "logLevel",
            value: spec.log_level,
        });
    }
    if spec.shared_dev_num < 0 {
        return Err(ValidationError::Negative {
            field: "sharedDevNum",
            value: spec.shared_dev_num,
        });
    }

    check_policies(spec)?;

    let policy = effective_policy(spec);
    if policy != AllocationPolicy::None && spec.shared_dev_num <= 1 {
        return Err(ValidationError::PolicyWithoutSharing(policy.as_arg()));
    }

    Ok(())
}

/// Applies field defaults. Never fails.
#[must_use]
pub fn normalize(spec: &GpuDevicePluginSpec) -> NormalizedSpec {
    let init_image = Some(spec.init_image.trim())
        .filter(|image| !image.is_empty())
        .map(str::to_string);

    // An empty selector would match every node, so it is never left empty
    let node_selector = if spec.node_selector.is_empty() {
        BTreeMap::from([(ARCH_LABEL.to_string(), DEFAULT_ARCH.to_string())])
    } else {
        spec.node_selector.clone()
    };

    NormalizedSpec {
        image: spec.image.trim().to_string(),
        init_image,
        node_selector,
        log_level: spec.log_level.max(0),
        shared_dev_num: spec.shared_dev_num.max(1),
        allocation_policy: effective_policy(spec),
        enable_monitoring: spec.enable_monitoring,
        tolerations: spec.tolerations.clone(),
    }
}

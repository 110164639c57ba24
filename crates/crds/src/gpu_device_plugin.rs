//! GpuDevicePlugin CRD
//!
//! Declares how the Intel GPU device plugin DaemonSet should run across the
//! cluster. The operator owns one DaemonSet per resource and reports its
//! identity and health back onto the status subresource.

use crate::conditions::{PluginCondition, WorkloadReference};
use crate::device_plugin::DevicePlugin;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Desired configuration of the GPU device plugin DaemonSet
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "deviceplugin.intel.com",
    version = "v1",
    kind = "GpuDevicePlugin",
    plural = "gpudeviceplugins",
    shortname = "gpudp",
    status = "GpuDevicePluginStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desiredNumberScheduled"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.numberReady"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GpuDevicePluginSpec {
    /// Container image of the GPU device plugin
    pub image: String,

    /// Init container image; empty means no init stage
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub init_image: String,

    /// Node selector for the DaemonSet pods; empty defaults to amd64 nodes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Plugin log verbosity
    #[serde(default)]
    pub log_level: i32,

    /// Number of containers that can share one GPU device
    #[serde(default = "default_shared_dev_num")]
    pub shared_dev_num: i32,

    /// Device allocation policy used when devices are shared
    #[serde(default)]
    pub allocation_policy: AllocationPolicy,

    /// Schema generation 1 name of `allocationPolicy`; cleared on migration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_allocation_policy: Option<AllocationPolicy>,

    /// Expose a monitoring resource for node-wide GPU telemetry
    #[serde(default)]
    pub enable_monitoring: bool,

    /// Tolerations for the DaemonSet pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<PluginToleration>,
}

fn default_shared_dev_num() -> i32 {
    1
}

impl Default for GpuDevicePluginSpec {
    fn default() -> Self {
        Self {
            image: String::new(),
            init_image: String::new(),
            node_selector: BTreeMap::new(),
            log_level: 0,
            shared_dev_num: default_shared_dev_num(),
            allocation_policy: AllocationPolicy::default(),
            preferred_allocation_policy: None,
            enable_monitoring: false,
            tolerations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
/// Device allocation policy
///
/// Serializes lowercase, which is also the value passed to the plugin binary.
#[serde(rename_all = "lowercase")]
pub enum AllocationPolicy {
    /// No preference
    #[default]
    None,

    /// Spread containers across devices
    Balanced,

    /// Fill one device before using the next
    Packed,
}

impl AllocationPolicy {
    /// Value passed to `-allocation-policy`
    #[must_use]
    pub fn as_arg(self) -> &'static str {
        match self {
            AllocationPolicy::None => "none",
            AllocationPolicy::Balanced => "balanced",
            AllocationPolicy::Packed => "packed",
        }
    }
}

/// Pod toleration for the plugin DaemonSet
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PluginToleration {
    /// Taint key the toleration applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// `Exists` or `Equal`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,

    /// Taint value to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Taint effect to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,

    /// How long a `NoExecute` taint is tolerated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

/// Observed state of the owned DaemonSet, written by the operator
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GpuDevicePluginStatus {
    /// Reference to the DaemonSet controlled by this resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlled_daemon_set: Option<WorkloadReference>,

    /// Number of nodes that should run the plugin
    #[serde(default)]
    pub desired_number_scheduled: i32,

    /// Number of nodes running a ready plugin pod
    #[serde(default)]
    pub number_ready: i32,

    /// Ready and Degraded conditions, in that order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PluginCondition>,

    /// Generation of the spec the status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl DevicePlugin for GpuDevicePlugin {
    const PLUGIN_KIND: &'static str = "gpu";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_plugin::{LEGACY_SCHEMA_GENERATION, SCHEMA_GENERATION_ANNOTATION};
    use kube::CustomResourceExt;

    #[test]
    fn test_spec_defaults_from_minimal_manifest() {
        let spec: GpuDevicePluginSpec =
            serde_json::from_value(serde_json::json!({ "image": "intel/intel-gpu-plugin:0.30.0" }))
                .expect("minimal spec should deserialize");

        assert_eq!(spec.image, "intel/intel-gpu-plugin:0.30.0");
        assert!(spec.init_image.is_empty());
        assert!(spec.node_selector.is_empty());
        assert_eq!(spec.log_level, 0);
        assert_eq!(spec.shared_dev_num, 1);
        assert_eq!(spec.allocation_policy, AllocationPolicy::None);
        assert_eq!(spec.preferred_allocation_policy, None);
    }

    #[test]
    fn test_allocation_policy_wire_format() {
        let policy: AllocationPolicy = serde_json::from_value(serde_json::json!("balanced")).expect("valid policy");
        assert_eq!(policy, AllocationPolicy::Balanced);
        assert_eq!(serde_json::to_value(AllocationPolicy::Packed).expect("serialize"), "packed");
        assert_eq!(AllocationPolicy::None.as_arg(), "none");
    }

    #[test]
    fn test_spec_serializes_camel_case() {
        let spec = GpuDevicePluginSpec {
            image: "gpu-testimage".to_string(),
            init_image: "gpu-testinitimage".to_string(),
            shared_dev_num: 42,
            ..Default::default()
        };
        let value = serde_json::to_value(&spec).expect("serialize");
        assert_eq!(value["initImage"], "gpu-testinitimage");
        assert_eq!(value["sharedDevNum"], 42);
        assert_eq!(value["allocationPolicy"], "none");
        assert!(value.get("preferredAllocationPolicy").is_none());
    }

    #[test]
    fn test_crd_is_cluster_scoped() {
        let crd = GpuDevicePlugin::crd();
        assert_eq!(crd.spec.group, "deviceplugin.intel.com");
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.kind, "GpuDevicePlugin");
    }

    #[test]
    fn test_workload_name_is_derived_from_resource_name() {
        let plugin = GpuDevicePlugin::new("gpudeviceplugin-test", GpuDevicePluginSpec::default());
        assert_eq!(plugin.workload_name(), "intel-gpu-plugin-gpudeviceplugin-test");
        assert_eq!(GpuDevicePlugin::container_name(), "intel-gpu-plugin");
    }

    #[test]
    fn test_schema_generation_annotation() {
        let mut plugin = GpuDevicePlugin::new("gpu", GpuDevicePluginSpec::default());
        assert_eq!(plugin.schema_generation(), Ok(LEGACY_SCHEMA_GENERATION));

        plugin.metadata.annotations = Some(BTreeMap::from([(
            SCHEMA_GENERATION_ANNOTATION.to_string(),
            "2".to_string(),
        )]));
        assert_eq!(plugin.schema_generation(), Ok(2));

        plugin.metadata.annotations = Some(BTreeMap::from([(
            SCHEMA_GENERATION_ANNOTATION.to_string(),
            "two".to_string(),
        )]));
        assert!(plugin.schema_generation().is_err());
    }
}

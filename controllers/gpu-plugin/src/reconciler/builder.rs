//! Desired workload construction
//!
//! [`build`] is pure: the same normalized spec and owner always produce the
//! same [`DesiredWorkload`], and the same DaemonSet manifest from it. The
//! diff relies on that to detect no-op passes.

use crate::reconciler::normalize::NormalizedSpec;
use crate::reconciler::ownership::OwnerIdentity;
use crds::{DevicePlugin, GpuDevicePlugin, PluginToleration};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, HostPathVolumeSource, ObjectFieldSelector, PodSpec, PodTemplateSpec,
    SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use std::collections::BTreeMap;

/// Value of the `app` label on plugin DaemonSets and pods
pub const APP_LABEL_VALUE: &str = "intel-gpu-plugin";

/// Name of the init container that installs NFD feature hooks
pub const INIT_CONTAINER_NAME: &str = "intel-gpu-initcontainer";

/// Volume the init container writes NFD hooks into
pub const NFD_VOLUME_NAME: &str = "nfd-features";

/// Host directory NFD reads local feature hooks from
pub const NFD_FEATURES_PATH: &str = "/etc/kubernetes/node-feature-discovery/source.d/";

const HOST_VOLUMES: [(&str, &str, bool); 3] = [
    ("devfs", "/dev/dri", true),
    ("sysfsdrm", "/sys/class/drm", true),
    ("kubeletsockets", "/var/lib/kubelet/device-plugins", false),
];

/// The workload a resource should have, before rendering to a manifest
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredWorkload {
    /// DaemonSet name
    pub name: String,
    /// DaemonSet namespace
    pub namespace: String,
    /// Plugin container name
    pub container_name: String,
    /// Plugin image
    pub image: String,
    /// Plugin arguments in stable order
    pub args: Vec<String>,
    /// Init container image, if the init stage is wanted
    pub init_image: Option<String>,
    /// Pod node selector, never empty
    pub node_selector: BTreeMap<String, String>,
    /// Pod tolerations
    pub tolerations: Vec<Toleration>,
    /// Controller reference to the resource
    pub owner: OwnerReference,
}

/// Plugin arguments for a normalized spec.
///
/// Order is fixed so repeated builds compare equal.
#[must_use]
pub fn build_args(spec: &NormalizedSpec) -> Vec<String> {
    let mut args = vec![
        "-v".to_string(),
        spec.log_level.to_string(),
        "-shared-dev-num".to_string(),
        spec.shared_dev_num.to_string(),
        "-allocation-policy".to_string(),
        spec.allocation_policy.as_arg().to_string(),
    ];
    if spec.enable_monitoring {
        args.push("-enable-monitoring".to_string());
    }
    args
}

fn to_toleration(t: &PluginToleration) -> Toleration {
    Toleration {
        key: t.key.clone(),
        operator: t.operator.clone(),
        value: t.value.clone(),
        effect: t.effect.clone(),
        toleration_seconds: t.toleration_seconds,
    }
}

/// Computes the desired workload for a resource.
#[must_use]
pub fn build(spec: &NormalizedSpec, owner: &OwnerIdentity, namespace: &str) -> DesiredWorkload {
    DesiredWorkload {
        name: GpuDevicePlugin::workload_name_for(&owner.name),
        namespace: namespace.to_string(),
        container_name: GpuDevicePlugin::container_name(),
        image: spec.image.clone(),
        args: build_args(spec),
        init_image: spec.init_image.clone(),
        node_selector: spec.node_selector.clone(),
        tolerations: spec.tolerations.iter().map(to_toleration).collect(),
        owner: owner.owner_reference(),
    }
}

fn app_labels() -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), APP_LABEL_VALUE.to_string())])
}

fn host_path_volume(name: &str, path: &str, type_: Option<&str>) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: type_.map(str::to_string),
        }),
        ..Default::default()
    }
}

fn read_only_root() -> SecurityContext {
    SecurityContext {
        read_only_root_filesystem: Some(true),
        allow_privilege_escalation: Some(false),
        ..Default::default()
    }
}

impl DesiredWorkload {
    /// Volume shared between the init container and the host
    #[must_use]
    pub fn nfd_volume() -> Volume {
        host_path_volume(NFD_VOLUME_NAME, NFD_FEATURES_PATH, Some("DirectoryOrCreate"))
    }

    /// Init container, present iff an init image is set
    #[must_use]
    pub fn init_container(&self) -> Option<Container> {
        self.init_image.as_ref().map(|image| Container {
            name: INIT_CONTAINER_NAME.to_string(),
            image: Some(image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            security_context: Some(read_only_root()),
            volume_mounts: Some(vec![VolumeMount {
                name: NFD_VOLUME_NAME.to_string(),
                mount_path: NFD_FEATURES_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        })
    }

    fn plugin_container(&self) -> Container {
        Container {
            name: self.container_name.clone(),
            image: Some(self.image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            args: Some(self.args.clone()),
            env: Some(vec![EnvVar {
                name: "NODE_NAME".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "spec.nodeName".to_string(),
                        api_version: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            security_context: Some(read_only_root()),
            volume_mounts: Some(
                HOST_VOLUMES
                    .iter()
                    .map(|(name, path, read_only)| VolumeMount {
                        name: (*name).to_string(),
                        mount_path: (*path).to_string(),
                        read_only: read_only.then_some(true),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    /// Full DaemonSet manifest for a create.
    #[must_use]
    pub fn to_daemon_set(&self) -> DaemonSet {
        let mut volumes: Vec<Volume> = HOST_VOLUMES
            .iter()
            .map(|(name, path, _)| host_path_volume(name, path, None))
            .collect();
        let init_container = self.init_container();
        if init_container.is_some() {
            volumes.push(Self::nfd_volume());
        }

        DaemonSet {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(app_labels()),
                owner_references: Some(vec![self.owner.clone()]),
                ..Default::default()
            },
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(app_labels()),
                    match_expressions: None,
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(app_labels()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![self.plugin_container()],
                        init_containers: init_container.map(|c| vec![c]),
                        node_selector: Some(self.node_selector.clone()),
                        tolerations: (!self.tolerations.is_empty()).then(|| self.tolerations.clone()),
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}

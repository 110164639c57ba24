//! Typed DaemonSet patches
//!
//! A [`WorkloadPatch`] carries only the pod-template substructures the
//! operator owns and that differ from the live object. It renders to a
//! strategic merge patch for the API server, and can be applied in memory
//! with the same semantics for tests.
//!
//! Merge rules mirrored from the PodSpec patch strategy:
//! - `containers` / `initContainers` / `volumes` merge by `name`
//! - `nodeSelector` merges by key; a `null` value removes the key
//! - `tolerations` is replaced wholesale

use crate::error::StoreError;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Container, Toleration, Volume};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

/// Change to the plugin container
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerChange {
    /// Container name (merge key)
    pub name: String,
    /// New image, if changed
    pub image: Option<String>,
    /// New argument list, if changed
    pub args: Option<Vec<String>>,
}

/// Change to the init stage
#[derive(Debug, Clone, PartialEq)]
pub enum InitStageChange {
    /// Add the init container (or update it in place) with its volume
    Add {
        /// Full init container definition
        container: Container,
        /// Volume the init container mounts
        volume: Volume,
    },
    /// Remove the init container and its volume
    Remove {
        /// Init container name
        container_name: String,
        /// Volume name
        volume_name: String,
    },
}

/// Minimal set of changes to bring a DaemonSet to the desired state
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkloadPatch {
    /// Plugin container image/args
    pub container: Option<ContainerChange>,
    /// Init stage add/remove
    pub init_stage: Option<InitStageChange>,
    /// Node selector keys to set (`Some`) or remove (`None`)
    pub node_selector: Option<BTreeMap<String, Option<String>>>,
    /// Replacement tolerations
    pub tolerations: Option<Vec<Toleration>>,
}

impl WorkloadPatch {
    /// Whether the patch would change nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.container.is_none()
            && self.init_stage.is_none()
            && self.node_selector.is_none()
            && self.tolerations.is_none()
    }

    /// Names of the changed fields, for logging
    #[must_use]
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if let Some(container) = &self.container {
            if container.image.is_some() {
                fields.push("image");
            }
            if container.args.is_some() {
                fields.push("args");
            }
        }
        if self.init_stage.is_some() {
            fields.push("initContainers");
        }
        if self.node_selector.is_some() {
            fields.push("nodeSelector");
        }
        if self.tolerations.is_some() {
            fields.push("tolerations");
        }
        fields
    }

    /// Render as a strategic merge patch body.
    ///
    /// `resource_version` is embedded as a precondition so that a write
    /// racing with another writer is rejected with 409.
    pub fn to_strategic_merge(&self, resource_version: Option<&str>) -> Result<Value, StoreError> {
        let mut pod_spec = Map::new();

        if let Some(change) = &self.container {
            let mut container = Map::new();
            container.insert("name".to_string(), json!(change.name));
            if let Some(image) = &change.image {
                container.insert("image".to_string(), json!(image));
            }
            if let Some(args) = &change.args {
                container.insert("args".to_string(), json!(args));
            }
            pod_spec.insert("containers".to_string(), Value::Array(vec![Value::Object(container)]));
        }

        match &self.init_stage {
            Some(InitStageChange::Add { container, volume }) => {
                pod_spec.insert("initContainers".to_string(), json!([serde_json::to_value(container)?]));
                pod_spec.insert("volumes".to_string(), json!([serde_json::to_value(volume)?]));
            }
            Some(InitStageChange::Remove { container_name, volume_name }) => {
                pod_spec.insert(
                    "initContainers".to_string(),
                    json!([{ "name": container_name, "$patch": "delete" }]),
                );
                pod_spec.insert(
                    "volumes".to_string(),
                    json!([{ "name": volume_name, "$patch": "delete" }]),
                );
            }
            None => {}
        }

        if let Some(selector) = &self.node_selector {
            let entries = selector
                .iter()
                .map(|(key, value)| (key.clone(), value.as_ref().map_or(Value::Null, |v| json!(v))))
                .collect::<Map<_, _>>();
            pod_spec.insert("nodeSelector".to_string(), Value::Object(entries));
        }

        if let Some(tolerations) = &self.tolerations {
            pod_spec.insert("tolerations".to_string(), serde_json::to_value(tolerations)?);
        }

        let mut body = json!({ "spec": { "template": { "spec": Value::Object(pod_spec) } } });
        if let Some(rv) = resource_version {
            body["metadata"] = json!({ "resourceVersion": rv });
        }
        Ok(body)
    }

    /// Apply the patch to an in-memory DaemonSet with strategic merge semantics.
    pub fn apply_to(&self, daemon_set: &mut DaemonSet) {
        let Some(spec) = daemon_set.spec.as_mut() else {
            return;
        };
        let pod = spec.template.spec.get_or_insert_with(Default::default);

        if let Some(change) = &self.container {
            let index = match pod.containers.iter().position(|c| c.name == change.name) {
                Some(index) => index,
                None => {
                    pod.containers.push(Container {
                        name: change.name.clone(),
                        ..Default::default()
                    });
                    pod.containers.len() - 1
                }
            };
            let container = &mut pod.containers[index];
            if let Some(image) = &change.image {
                container.image = Some(image.clone());
            }
            if let Some(args) = &change.args {
                container.args = Some(args.clone());
            }
        }

        match &self.init_stage {
            Some(InitStageChange::Add { container, volume }) => {
                let init_containers = pod.init_containers.get_or_insert_with(Vec::new);
                init_containers.retain(|c| c.name != container.name);
                init_containers.push(container.clone());
                let volumes = pod.volumes.get_or_insert_with(Vec::new);
                volumes.retain(|v| v.name != volume.name);
                volumes.push(volume.clone());
            }
            Some(InitStageChange::Remove { container_name, volume_name }) => {
                if let Some(init_containers) = pod.init_containers.as_mut() {
                    init_containers.retain(|c| &c.name != container_name);
                }
                if pod.init_containers.as_ref().is_some_and(Vec::is_empty) {
                    pod.init_containers = None;
                }
                if let Some(volumes) = pod.volumes.as_mut() {
                    volumes.retain(|v| &v.name != volume_name);
                }
                if pod.volumes.as_ref().is_some_and(Vec::is_empty) {
                    pod.volumes = None;
                }
            }
            None => {}
        }

        if let Some(changes) = &self.node_selector {
            let selector = pod.node_selector.get_or_insert_with(BTreeMap::new);
            for (key, value) in changes {
                match value {
                    Some(value) => {
                        selector.insert(key.clone(), value.clone());
                    }
                    None => {
                        selector.remove(key);
                    }
                }
            }
            if selector.is_empty() {
                pod.node_selector = None;
            }
        }

        if let Some(tolerations) = &self.tolerations {
            pod.tolerations = if tolerations.is_empty() {
                None
            } else {
                Some(tolerations.clone())
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DaemonSetSpec;
    use k8s_openapi::api::core::v1::{HostPathVolumeSource, PodSpec, PodTemplateSpec};

    fn daemon_set_with(pod: PodSpec) -> DaemonSet {
        DaemonSet {
            spec: Some(DaemonSetSpec {
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(pod),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn nfd_volume() -> Volume {
        Volume {
            name: "nfd-features".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: "/etc/kubernetes/node-feature-discovery/source.d/".to_string(),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_patch() {
        let patch = WorkloadPatch::default();
        assert!(patch.is_empty());
        assert!(patch.changed_fields().is_empty());
    }

    #[test]
    fn test_strategic_merge_carries_only_changed_container_fields() {
        let patch = WorkloadPatch {
            container: Some(ContainerChange {
                name: "intel-gpu-plugin".to_string(),
                image: Some("updated-gpu-testimage".to_string()),
                args: None,
            }),
            ..Default::default()
        };

        let body = patch.to_strategic_merge(Some("42")).expect("render");
        let containers = &body["spec"]["template"]["spec"]["containers"];
        assert_eq!(containers[0]["name"], "intel-gpu-plugin");
        assert_eq!(containers[0]["image"], "updated-gpu-testimage");
        assert!(containers[0].get("args").is_none());
        assert!(body["spec"]["template"]["spec"].get("nodeSelector").is_none());
        assert_eq!(body["metadata"]["resourceVersion"], "42");
    }

    #[test]
    fn test_strategic_merge_removals_use_null_and_delete_directives() {
        let patch = WorkloadPatch {
            init_stage: Some(InitStageChange::Remove {
                container_name: "intel-gpu-initcontainer".to_string(),
                volume_name: "nfd-features".to_string(),
            }),
            node_selector: Some(BTreeMap::from([
                ("gpu-nodeselector".to_string(), None),
                ("kubernetes.io/arch".to_string(), Some("amd64".to_string())),
            ])),
            ..Default::default()
        };

        let body = patch.to_strategic_merge(None).expect("render");
        let pod = &body["spec"]["template"]["spec"];
        assert_eq!(pod["initContainers"][0]["$patch"], "delete");
        assert_eq!(pod["volumes"][0]["name"], "nfd-features");
        assert!(pod["nodeSelector"]["gpu-nodeselector"].is_null());
        assert_eq!(pod["nodeSelector"]["kubernetes.io/arch"], "amd64");
        assert!(body.get("metadata").is_none());
    }

    #[test]
    fn test_apply_removes_init_stage_and_selector_keys() {
        let mut ds = daemon_set_with(PodSpec {
            containers: vec![Container {
                name: "intel-gpu-plugin".to_string(),
                image: Some("gpu-testimage".to_string()),
                ..Default::default()
            }],
            init_containers: Some(vec![Container {
                name: "intel-gpu-initcontainer".to_string(),
                image: Some("gpu-testinitimage".to_string()),
                ..Default::default()
            }]),
            volumes: Some(vec![nfd_volume()]),
            node_selector: Some(BTreeMap::from([("gpu-nodeselector".to_string(), "true".to_string())])),
            ..Default::default()
        });

        let patch = WorkloadPatch {
            init_stage: Some(InitStageChange::Remove {
                container_name: "intel-gpu-initcontainer".to_string(),
                volume_name: "nfd-features".to_string(),
            }),
            node_selector: Some(BTreeMap::from([
                ("gpu-nodeselector".to_string(), None),
                ("kubernetes.io/arch".to_string(), Some("amd64".to_string())),
            ])),
            ..Default::default()
        };
        patch.apply_to(&mut ds);

        let pod = ds.spec.and_then(|s| s.template.spec).expect("pod spec");
        assert!(pod.init_containers.is_none());
        assert!(pod.volumes.is_none());
        assert_eq!(
            pod.node_selector,
            Some(BTreeMap::from([("kubernetes.io/arch".to_string(), "amd64".to_string())]))
        );
        assert_eq!(pod.containers[0].image.as_deref(), Some("gpu-testimage"));
    }

    #[test]
    fn test_apply_adds_init_stage_in_place() {
        let mut ds = daemon_set_with(PodSpec::default());
        let patch = WorkloadPatch {
            init_stage: Some(InitStageChange::Add {
                container: Container {
                    name: "intel-gpu-initcontainer".to_string(),
                    image: Some("gpu-testinitimage".to_string()),
                    ..Default::default()
                },
                volume: nfd_volume(),
            }),
            ..Default::default()
        };
        patch.apply_to(&mut ds);
        patch.apply_to(&mut ds);

        let pod = ds.spec.and_then(|s| s.template.spec).expect("pod spec");
        assert_eq!(pod.init_containers.map(|c| c.len()), Some(1));
        assert_eq!(pod.volumes.map(|v| v.len()), Some(1));
    }
}

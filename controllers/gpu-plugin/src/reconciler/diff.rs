//! Desired vs observed workload comparison
//!
//! Only the fields the controller owns are compared: plugin image and
//! arguments, the init stage, the node selector and tolerations. Anything
//! else on the live DaemonSet (labels injected by other tools, defaults the
//! API server fills in) is left alone.

use crate::reconciler::builder::{DesiredWorkload, INIT_CONTAINER_NAME, NFD_VOLUME_NAME};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Toleration;
use std::collections::BTreeMap;
use workload_store::{ContainerChange, InitStageChange, WorkloadPatch};

/// The parts of a live DaemonSet the diff looks at
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObservedWorkload {
    /// Resource version read from the store
    pub resource_version: Option<String>,
    /// Plugin container image, `None` if the container is missing
    pub image: Option<String>,
    /// Plugin container arguments
    pub args: Vec<String>,
    /// Init container image, `None` if there is no init container
    pub init_image: Option<String>,
    /// Whether the NFD volume is mounted into the pod
    pub has_nfd_volume: bool,
    /// Pod node selector
    pub node_selector: BTreeMap<String, String>,
    /// Pod tolerations
    pub tolerations: Vec<Toleration>,
}

impl ObservedWorkload {
    /// Extracts the owned fields of `ds`, looking the plugin container up by name.
    #[must_use]
    pub fn from_daemon_set(ds: &DaemonSet, container_name: &str) -> Self {
        let pod = ds.spec.as_ref().and_then(|s| s.template.spec.as_ref());
        let Some(pod) = pod else {
            return Self {
                resource_version: ds.metadata.resource_version.clone(),
                ..Default::default()
            };
        };

        let plugin = pod.containers.iter().find(|c| c.name == container_name);
        let init = pod
            .init_containers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|c| c.name == INIT_CONTAINER_NAME);

        Self {
            resource_version: ds.metadata.resource_version.clone(),
            image: plugin.and_then(|c| c.image.clone()),
            args: plugin.and_then(|c| c.args.clone()).unwrap_or_default(),
            // An init container without an image still needs replacing
            init_image: init.map(|c| c.image.clone().unwrap_or_default()),
            has_nfd_volume: pod
                .volumes
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|v| v.name == NFD_VOLUME_NAME),
            node_selector: pod.node_selector.clone().unwrap_or_default(),
            tolerations: pod.tolerations.clone().unwrap_or_default(),
        }
    }
}

/// What to do to bring the workload in line
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOutcome {
    /// No workload yet
    Create,
    /// Workload differs in the carried fields
    Patch(WorkloadPatch),
    /// Nothing to do
    NoOp,
}

/// Splits an argument list into `(flag, value)` pairs, sorted.
///
/// A flag's value is the next token unless that token is itself a flag, so
/// `-v 2 -enable-monitoring` becomes `[("-enable-monitoring", None), ("-v", Some("2"))]`.
fn argument_pairs(args: &[String]) -> Vec<(&str, Option<&str>)> {
    let mut pairs = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(token) = iter.next() {
        let value = iter
            .next_if(|next| !next.starts_with('-'))
            .map(String::as_str);
        pairs.push((token.as_str(), value));
    }
    pairs.sort_unstable();
    pairs
}

/// Whether two argument lists carry the same flags and values in any order.
#[must_use]
pub fn same_arguments(a: &[String], b: &[String]) -> bool {
    argument_pairs(a) == argument_pairs(b)
}

fn selector_changes(
    desired: &BTreeMap<String, String>,
    observed: &BTreeMap<String, String>,
) -> Option<BTreeMap<String, Option<String>>> {
    let mut changes: BTreeMap<String, Option<String>> = desired
        .iter()
        .filter(|(key, value)| observed.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), Some(value.clone())))
        .collect();
    changes.extend(
        observed
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .map(|key| (key.clone(), None)),
    );
    (!changes.is_empty()).then_some(changes)
}

fn init_stage_change(desired: &DesiredWorkload, observed: &ObservedWorkload) -> Option<InitStageChange> {
    match (desired.init_container(), &observed.init_image) {
        (Some(container), current) => {
            let up_to_date = current.as_ref() == container.image.as_ref() && observed.has_nfd_volume;
            (!up_to_date).then(|| InitStageChange::Add {
                container,
                volume: DesiredWorkload::nfd_volume(),
            })
        }
        (None, current) => (current.is_some() || observed.has_nfd_volume).then(|| InitStageChange::Remove {
            container_name: INIT_CONTAINER_NAME.to_string(),
            volume_name: NFD_VOLUME_NAME.to_string(),
        }),
    }
}

/// Compares desired and observed state.
#[must_use]
pub fn diff(desired: &DesiredWorkload, observed: Option<&ObservedWorkload>) -> DiffOutcome {
    let Some(observed) = observed else {
        return DiffOutcome::Create;
    };

    let image = (observed.image.as_deref() != Some(desired.image.as_str())).then(|| desired.image.clone());
    let args = (observed.image.is_none() || !same_arguments(&desired.args, &observed.args))
        .then(|| desired.args.clone());
    let container = (image.is_some() || args.is_some()).then(|| ContainerChange {
        name: desired.container_name.clone(),
        image,
        args,
    });

    let patch = WorkloadPatch {
        container,
        init_stage: init_stage_change(desired, observed),
        node_selector: selector_changes(&desired.node_selector, &observed.node_selector),
        tolerations: (desired.tolerations != observed.tolerations).then(|| desired.tolerations.clone()),
    };

    if patch.is_empty() {
        DiffOutcome::NoOp
    } else {
        DiffOutcome::Patch(patch)
    }
}

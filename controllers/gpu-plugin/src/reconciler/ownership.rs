//! Ownership links between resources and workloads
//!
//! The controller owner reference on a DaemonSet is what makes the garbage
//! collector delete it with its resource, and what tells us a DaemonSet with
//! the expected name is really ours.

use crate::error::ControllerError;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;

/// Identity of the resource that owns a workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerIdentity {
    /// `group/version` of the owner
    pub api_version: String,
    /// Owner kind
    pub kind: String,
    /// Owner name
    pub name: String,
    /// Owner UID
    pub uid: String,
}

impl OwnerIdentity {
    /// Identity of a stored resource; fails if it has no name or UID yet.
    pub fn of<K: Resource<DynamicType = ()>>(resource: &K) -> Result<Self, ControllerError> {
        let meta = resource.meta();
        let name = meta
            .name
            .clone()
            .ok_or_else(|| ControllerError::InvalidResource(format!("{} missing name", K::kind(&()))))?;
        let uid = meta
            .uid
            .clone()
            .ok_or_else(|| ControllerError::InvalidResource(format!("{} {} missing uid", K::kind(&()), name)))?;

        Ok(Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            name,
            uid,
        })
    }

    /// Controller owner reference pointing at this identity
    #[must_use]
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

/// How an existing workload relates to a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// Controlled by the resource
    Owned,
    /// Controlled by another object (kind/name)
    Foreign(String),
    /// No controller at all
    Unowned,
}

/// Classifies `workload` against `owner` by controller reference UID.
#[must_use]
pub fn classify(workload: &DaemonSet, owner: &OwnerIdentity) -> Ownership {
    let controller = workload
        .metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|r| r.controller == Some(true));

    match controller {
        Some(r) if r.uid == owner.uid => Ownership::Owned,
        Some(r) => Ownership::Foreign(format!("{}/{}", r.kind, r.name)),
        None => Ownership::Unowned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::GpuDevicePlugin;

    fn owner() -> OwnerIdentity {
        let mut plugin = GpuDevicePlugin::new("gpu", Default::default());
        plugin.metadata.uid = Some("uid-1".to_string());
        OwnerIdentity::of(&plugin).expect("identity")
    }

    fn workload_with(refs: Vec<OwnerReference>) -> DaemonSet {
        let mut ds = DaemonSet::default();
        ds.metadata.owner_references = Some(refs);
        ds
    }

    #[test]
    fn test_owner_reference_is_controller() {
        let reference = owner().owner_reference();
        assert_eq!(reference.api_version, "deviceplugin.intel.com/v1");
        assert_eq!(reference.kind, "GpuDevicePlugin");
        assert_eq!(reference.controller, Some(true));
        assert_eq!(reference.block_owner_deletion, Some(true));
    }

    #[test]
    fn test_identity_requires_uid() {
        let plugin = GpuDevicePlugin::new("gpu", Default::default());
        assert!(matches!(
            OwnerIdentity::of(&plugin),
            Err(ControllerError::InvalidResource(_))
        ));
    }

    #[test]
    fn test_classify() {
        let owner = owner();
        assert_eq!(classify(&workload_with(vec![owner.owner_reference()]), &owner), Ownership::Owned);

        let mut other = owner.owner_reference();
        other.uid = "uid-2".to_string();
        other.name = "other-gpu".to_string();
        assert_eq!(
            classify(&workload_with(vec![other]), &owner),
            Ownership::Foreign("GpuDevicePlugin/other-gpu".to_string())
        );

        // A non-controller reference does not confer ownership
        let mut weak = owner.owner_reference();
        weak.controller = None;
        assert_eq!(classify(&workload_with(vec![weak]), &owner), Ownership::Unowned);
        assert_eq!(classify(&DaemonSet::default(), &owner), Ownership::Unowned);
    }
}

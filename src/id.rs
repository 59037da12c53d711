//! Opaque typed identifiers for registered resources
//!
//! Every registration returns a typed id wrapping a randomly generated
//! 128-bit token. Ids are never interpreted; two equal ids denote the same
//! resource. The typed wrappers exist so a release id cannot be passed where
//! an image id is expected, and so each id knows which dependency bucket it
//! belongs in.

use crate::deps::{ClusterDependencies, ClusterDependency, ResourceDependencies, ResourceDependency};

/// Allocate a fresh opaque id
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Identifies a registered cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterId(pub(crate) String);

/// Identifies a registered third-party image
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ThirdPartyImageId(pub(crate) String);

/// Identifies a registered custom image
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CustomImageId(pub(crate) String);

/// Identifies a registered image archive
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageArchiveId(pub(crate) String);

/// Identifies a registered manifest set
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ManifestSetId(pub(crate) String);

/// Identifies a registered helm release
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReleaseId(pub(crate) String);

/// Identifies a registered cluster action
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterActionId(pub(crate) String);

impl ResourceDependency for ThirdPartyImageId {
    fn append_to(&self, deps: &mut ResourceDependencies) {
        deps.third_party_images.push(self.clone());
    }
}

impl ClusterDependency for ThirdPartyImageId {
    fn append_to(&self, deps: &mut ClusterDependencies) {
        deps.third_party_images.push(self.clone());
    }
}

impl ResourceDependency for CustomImageId {
    fn append_to(&self, deps: &mut ResourceDependencies) {
        deps.custom_images.push(self.clone());
    }
}

impl ClusterDependency for CustomImageId {
    fn append_to(&self, deps: &mut ClusterDependencies) {
        deps.custom_images.push(self.clone());
    }
}

impl ResourceDependency for ImageArchiveId {
    fn append_to(&self, deps: &mut ResourceDependencies) {
        deps.image_archives.push(self.clone());
    }
}

impl ClusterDependency for ImageArchiveId {
    fn append_to(&self, deps: &mut ClusterDependencies) {
        deps.image_archives.push(self.clone());
    }
}

impl ResourceDependency for ManifestSetId {
    fn append_to(&self, deps: &mut ResourceDependencies) {
        deps.manifest_sets.push(self.clone());
    }
}

impl ResourceDependency for ReleaseId {
    fn append_to(&self, deps: &mut ResourceDependencies) {
        deps.releases.push(self.clone());
    }
}

impl ResourceDependency for ClusterActionId {
    fn append_to(&self, deps: &mut ResourceDependencies) {
        deps.cluster_actions.push(self.clone());
    }
}

// Lists of ids contribute element-wise to either bucket kind.

impl<T: ResourceDependency> ResourceDependency for Vec<T> {
    fn append_to(&self, deps: &mut ResourceDependencies) {
        for item in self {
            item.append_to(deps);
        }
    }
}

impl<T: ResourceDependency> ResourceDependency for [T] {
    fn append_to(&self, deps: &mut ResourceDependencies) {
        for item in self {
            item.append_to(deps);
        }
    }
}

impl<T: ClusterDependency> ClusterDependency for Vec<T> {
    fn append_to(&self, deps: &mut ClusterDependencies) {
        for item in self {
            item.append_to(deps);
        }
    }
}

impl<T: ClusterDependency> ClusterDependency for [T] {
    fn append_to(&self, deps: &mut ClusterDependencies) {
        for item in self {
            item.append_to(deps);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::{cluster_dependencies, resource_dependencies};

    #[test]
    fn test_ids_are_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        // rendered as text, 128 bits worth
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_equal_ids_denote_same_resource() {
        let id = ThirdPartyImageId(new_id());
        assert_eq!(id.clone(), id);
    }

    /// Story: heterogeneous contributors flatten into one bucket set
    #[test]
    fn story_ids_route_to_their_buckets() {
        let image = ThirdPartyImageId(new_id());
        let custom = CustomImageId(new_id());
        let release = ReleaseId(new_id());
        let manifests = ManifestSetId(new_id());

        let deps = resource_dependencies(&[&image, &custom, &release, &manifests]);
        assert_eq!(deps.third_party_images, vec![image.clone()]);
        assert_eq!(deps.custom_images, vec![custom.clone()]);
        assert_eq!(deps.releases, vec![release]);
        assert_eq!(deps.manifest_sets, vec![manifests]);

        let cluster_deps = cluster_dependencies(&[&image, &custom]);
        assert_eq!(cluster_deps.third_party_images.len(), 1);
        assert_eq!(cluster_deps.custom_images.len(), 1);
    }

    #[test]
    fn test_id_lists_contribute_elementwise() {
        let ids = vec![ThirdPartyImageId(new_id()), ThirdPartyImageId(new_id())];
        let deps = resource_dependencies(&[&ids]);
        assert_eq!(deps.third_party_images.len(), 2);
    }
}

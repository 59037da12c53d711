//! Dependency sets and their resolution into node ids
//!
//! Two shapes exist: [`ClusterDependencies`] names the images a cluster must
//! have loaded before it is considered ready for dependents;
//! [`ResourceDependencies`] names everything a resource (manifest set,
//! release, action) must wait for. Image entries in a resource dependency
//! resolve to the *load node* binding that image to the resource's owning
//! cluster, not to the pull/build node itself.

use crate::id::{
    ClusterActionId, CustomImageId, ImageArchiveId, ManifestSetId, ReleaseId, ThirdPartyImageId,
};

/// A contributor to a [`ResourceDependencies`] set
pub trait ResourceDependency {
    /// Add this contributor's ids to the appropriate buckets
    fn append_to(&self, deps: &mut ResourceDependencies);
}

/// A contributor to a [`ClusterDependencies`] set
pub trait ClusterDependency {
    /// Add this contributor's ids to the appropriate buckets
    fn append_to(&self, deps: &mut ClusterDependencies);
}

/// Everything a resource must wait for before its setup may start
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceDependencies {
    /// Third-party images that must be loaded to the resource's cluster
    pub third_party_images: Vec<ThirdPartyImageId>,
    /// Custom images that must be loaded to the resource's cluster
    pub custom_images: Vec<CustomImageId>,
    /// Image archives that must be loaded to the resource's cluster
    pub image_archives: Vec<ImageArchiveId>,
    /// Manifest sets that must be applied first
    pub manifest_sets: Vec<ManifestSetId>,
    /// Releases that must be installed first
    pub releases: Vec<ReleaseId>,
    /// Cluster actions that must have run first
    pub cluster_actions: Vec<ClusterActionId>,
}

/// Images a cluster must have loaded as part of coming up
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterDependencies {
    /// Third-party images to load after the cluster is created
    pub third_party_images: Vec<ThirdPartyImageId>,
    /// Custom images to load after the cluster is created
    pub custom_images: Vec<CustomImageId>,
    /// Image archives to load after the cluster is created
    pub image_archives: Vec<ImageArchiveId>,
}

/// An empty resource dependency set, for readable call sites
pub const NO_DEPENDENCIES: ResourceDependencies = ResourceDependencies {
    third_party_images: Vec::new(),
    custom_images: Vec::new(),
    image_archives: Vec::new(),
    manifest_sets: Vec::new(),
    releases: Vec::new(),
    cluster_actions: Vec::new(),
};

impl ResourceDependency for ResourceDependencies {
    fn append_to(&self, deps: &mut ResourceDependencies) {
        deps.third_party_images
            .extend(self.third_party_images.iter().cloned());
        deps.custom_images.extend(self.custom_images.iter().cloned());
        deps.image_archives
            .extend(self.image_archives.iter().cloned());
        deps.manifest_sets.extend(self.manifest_sets.iter().cloned());
        deps.releases.extend(self.releases.iter().cloned());
        deps.cluster_actions
            .extend(self.cluster_actions.iter().cloned());
    }
}

impl ClusterDependency for ClusterDependencies {
    fn append_to(&self, deps: &mut ClusterDependencies) {
        deps.third_party_images
            .extend(self.third_party_images.iter().cloned());
        deps.custom_images.extend(self.custom_images.iter().cloned());
        deps.image_archives
            .extend(self.image_archives.iter().cloned());
    }
}

/// Flatten a list of heterogeneous contributors into one resource set
pub fn resource_dependencies(deps: &[&dyn ResourceDependency]) -> ResourceDependencies {
    let mut all = ResourceDependencies::default();
    for dep in deps {
        dep.append_to(&mut all);
    }
    all
}

/// Flatten a list of heterogeneous contributors into one cluster set
pub fn cluster_dependencies(deps: &[&dyn ClusterDependency]) -> ClusterDependencies {
    let mut all = ClusterDependencies::default();
    for dep in deps {
        dep.append_to(&mut all);
    }
    all
}

//! The spec-state hierarchy
//!
//! A spec-state owns resource descriptors and the nodes registered against
//! them. The suite has a root state; each test may branch a child state that
//! inherits the parent's clusters as no-op wrappers and resolves everything
//! else through a parent chain walk. Descriptor maps are append-only during
//! registration and read-only during execution; the cleanup log is the only
//! structure mutated while nodes run, guarded by its own lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::actions::ClusterActionHooks;
use crate::cluster::{Cluster, NoopCluster, SerializedCluster};
use crate::deps::ResourceDependencies;
use crate::helm::HelmRelease;
use crate::images::{CustomImage, ImageArchive, ImageFormat, ThirdPartyImage};
use crate::manifests::ManifestSet;
use crate::node::{Action, SpecNode};

/// One scope of registered resources and the nodes that materialize them
pub(crate) struct SpecState {
    pub(crate) third_party_images: DashMap<String, ThirdPartyImage>,
    pub(crate) third_party_formats: DashMap<String, ImageFormat>,
    pub(crate) custom_images: DashMap<String, CustomImage>,
    pub(crate) custom_formats: DashMap<String, ImageFormat>,
    pub(crate) image_archives: DashMap<String, ImageArchive>,
    pub(crate) clusters: DashMap<String, Arc<dyn Cluster>>,
    pub(crate) manifest_sets: DashMap<String, ManifestSet>,
    pub(crate) releases: DashMap<String, HelmRelease>,
    pub(crate) cluster_actions: DashMap<String, ClusterActionHooks>,

    /// cluster id → image id → load-node id, one map per image kind
    pub(crate) third_party_loads: DashMap<String, BTreeMap<String, String>>,
    pub(crate) custom_loads: DashMap<String, BTreeMap<String, String>>,
    pub(crate) archive_loads: DashMap<String, BTreeMap<String, String>>,

    pub(crate) parent: Option<Arc<SpecState>>,

    /// Nodes in registration order
    pub(crate) setup: Mutex<Vec<SpecNode>>,
    /// Completed nodes in completion order; the teardown walks this
    pub(crate) cleanup: Mutex<Vec<SpecNode>>,
}

impl SpecState {
    pub(crate) fn new(parent: Option<Arc<SpecState>>) -> Self {
        Self {
            third_party_images: DashMap::new(),
            third_party_formats: DashMap::new(),
            custom_images: DashMap::new(),
            custom_formats: DashMap::new(),
            image_archives: DashMap::new(),
            clusters: DashMap::new(),
            manifest_sets: DashMap::new(),
            releases: DashMap::new(),
            cluster_actions: DashMap::new(),
            third_party_loads: DashMap::new(),
            custom_loads: DashMap::new(),
            archive_loads: DashMap::new(),
            parent,
            setup: Mutex::new(Vec::new()),
            cleanup: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Look up a cluster handle here or in an ancestor
    pub(crate) fn cluster(&self, id: &str) -> Option<Arc<dyn Cluster>> {
        match self.clusters.get(id) {
            Some(cluster) => Some(cluster.clone()),
            None => self.parent.as_ref().and_then(|p| p.cluster(id)),
        }
    }

    fn load_id(
        map: impl Fn(&SpecState) -> &DashMap<String, BTreeMap<String, String>>,
        state: &SpecState,
        cluster_id: &str,
        image_id: &str,
    ) -> Option<String> {
        if let Some(loads) = map(state).get(cluster_id) {
            if let Some(load) = loads.get(image_id) {
                return Some(load.clone());
            }
        }
        state
            .parent
            .as_ref()
            .and_then(|p| Self::load_id(map, p, cluster_id, image_id))
    }

    pub(crate) fn third_party_load_id(&self, cluster_id: &str, image_id: &str) -> Option<String> {
        Self::load_id(|s| &s.third_party_loads, self, cluster_id, image_id)
    }

    pub(crate) fn custom_load_id(&self, cluster_id: &str, image_id: &str) -> Option<String> {
        Self::load_id(|s| &s.custom_loads, self, cluster_id, image_id)
    }

    pub(crate) fn archive_load_id(&self, cluster_id: &str, image_id: &str) -> Option<String> {
        Self::load_id(|s| &s.archive_loads, self, cluster_id, image_id)
    }

    /// Whether a cluster id is known here or in an ancestor
    pub(crate) fn knows_cluster(&self, id: &str) -> bool {
        self.cluster(id).is_some()
    }

    fn lookup<T: Clone>(
        map: impl for<'a> Fn(&'a SpecState) -> &'a DashMap<String, T>,
        state: &SpecState,
        id: &str,
    ) -> Option<T> {
        if let Some(entry) = map(state).get(id) {
            return Some(entry.clone());
        }
        state.parent.as_ref().and_then(|p| Self::lookup(map, p, id))
    }

    pub(crate) fn third_party_image(&self, id: &str) -> Option<ThirdPartyImage> {
        Self::lookup(|s| &s.third_party_images, self, id)
    }

    pub(crate) fn custom_image(&self, id: &str) -> Option<CustomImage> {
        Self::lookup(|s| &s.custom_images, self, id)
    }

    pub(crate) fn image_archive(&self, id: &str) -> Option<ImageArchive> {
        Self::lookup(|s| &s.image_archives, self, id)
    }

    pub(crate) fn manifest_set(&self, id: &str) -> Option<ManifestSet> {
        Self::lookup(|s| &s.manifest_sets, self, id)
    }

    pub(crate) fn release(&self, id: &str) -> Option<HelmRelease> {
        Self::lookup(|s| &s.releases, self, id)
    }

    pub(crate) fn cluster_action(&self, id: &str) -> Option<ClusterActionHooks> {
        Self::lookup(|s| &s.cluster_actions, self, id)
    }

    pub(crate) fn third_party_format(&self, id: &str) -> ImageFormat {
        Self::lookup(|s| &s.third_party_formats, self, id).unwrap_or_default()
    }

    pub(crate) fn custom_format(&self, id: &str) -> ImageFormat {
        Self::lookup(|s| &s.custom_formats, self, id).unwrap_or_default()
    }

    /// Resolve a resource dependency set into the node ids a resource on
    /// `cluster_id` must wait for.
    ///
    /// Image entries resolve to the load node binding the image to that
    /// cluster. Naming an image that was never declared as a cluster
    /// dependency is an author mistake and panics.
    pub(crate) fn resolve_resource_deps(
        &self,
        cluster_id: &str,
        deps: &ResourceDependencies,
    ) -> Vec<String> {
        let mut depends_on = Vec::new();
        for image in &deps.third_party_images {
            depends_on.push(
                self.third_party_load_id(cluster_id, &image.0)
                    .unwrap_or_else(|| {
                        panic!(
                            "third-party image {} is not set to load to cluster {}",
                            image.0, cluster_id
                        )
                    }),
            );
        }
        for image in &deps.custom_images {
            depends_on.push(self.custom_load_id(cluster_id, &image.0).unwrap_or_else(|| {
                panic!(
                    "custom image {} is not set to load to cluster {}",
                    image.0, cluster_id
                )
            }));
        }
        for archive in &deps.image_archives {
            depends_on.push(
                self.archive_load_id(cluster_id, &archive.0)
                    .unwrap_or_else(|| {
                        panic!(
                            "image archive {} is not set to load to cluster {}",
                            archive.0, cluster_id
                        )
                    }),
            );
        }
        for manifests in &deps.manifest_sets {
            depends_on.push(manifests.0.clone());
        }
        for release in &deps.releases {
            depends_on.push(release.0.clone());
        }
        for action in &deps.cluster_actions {
            depends_on.push(action.0.clone());
        }
        depends_on
    }

    /// Append a node to the registration list
    pub(crate) fn push_node(&self, node: SpecNode) {
        self.setup
            .lock()
            .expect("setup list lock poisoned")
            .push(node);
    }

    /// Branch a child state.
    ///
    /// Every cluster visible in this state is adopted under the same id as a
    /// no-op wrapper, with a create node so child dependencies on the cluster
    /// id resolve.
    pub(crate) fn child(self: &Arc<Self>) -> Arc<SpecState> {
        let child = SpecState::new(Some(self.clone()));
        for entry in self.clusters.iter() {
            let id = entry.key().clone();
            child
                .clusters
                .insert(id.clone(), Arc::new(NoopCluster::new(entry.value().clone())));
            child.push_node(SpecNode {
                id: id.clone(),
                depends_on: Vec::new(),
                action: Action::CreateCluster { id },
            });
        }
        Arc::new(child)
    }

    /// Node ids of every ancestor-side resource, used to inject synthetic
    /// no-op nodes when a child's DAG is built. Cluster create nodes are
    /// excluded; the child carries its own adopted create nodes.
    pub(crate) fn ancestor_node_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        let mut current = self.parent.clone();
        while let Some(state) = current {
            for node in state.setup.lock().expect("setup list lock poisoned").iter() {
                if !matches!(node.action, Action::CreateCluster { .. }) {
                    ids.push(node.id.clone());
                }
            }
            current = state.parent.clone();
        }
        ids
    }

    /// Snapshot this state's clusters as plain data
    pub(crate) fn snapshot(&self) -> SerializedSpec {
        let mut clusters = BTreeMap::new();
        for entry in self.clusters.iter() {
            clusters.insert(
                entry.key().clone(),
                SerializedCluster::snapshot(entry.value().as_ref()),
            );
        }
        SerializedSpec { clusters }
    }
}

/// One spec-state's clusters as plain data
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct SerializedSpec {
    #[serde(rename = "Clusters")]
    pub(crate) clusters: BTreeMap<String, SerializedCluster>,
}

/// The wire form handed to parallel test workers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct SerializedSuite {
    /// Spec chain, leaf first
    #[serde(rename = "Specs")]
    pub(crate) specs: Vec<SerializedSpec>,
    /// The cluster ids the serializing side chose to expose, in order
    #[serde(rename = "ClusterIDs")]
    pub(crate) cluster_ids: Vec<String>,
}

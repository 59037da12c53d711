//! Suite options and the orchestrator handle
//!
//! [`Kindling`] is the handle everything goes through: registration of
//! resources against the current spec-state, branching child states for
//! individual tests, running setup and teardown, and snapshotting cluster
//! handles for parallel workers. The suite is an explicit object; cloning
//! the handle is cheap and every clone sees the same suite.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use crate::actions::ClusterActionHooks;
use crate::cluster::Cluster;
use crate::dag::{Dag, Executor};
use crate::deps::{
    cluster_dependencies, resource_dependencies, ClusterDependency, ResourceDependency,
};
use crate::helm::{consolidate_repos, Helm, HelmCli, HelmRelease};
use crate::id::{
    new_id, ClusterActionId, ClusterId, CustomImageId, ImageArchiveId, ManifestSetId, ReleaseId,
    ThirdPartyImageId,
};
use crate::images::{
    CustomImage, ImageArchive, ImageFormat, Images, RegistryPuller, ThirdPartyImage,
    DEFAULT_CUSTOM_IMAGE_TAG,
};
use crate::job::{Job, RunContext};
use crate::kubectl::{Kubectl, KubectlCli};
use crate::manifests::{ManifestSet, Manifests};
use crate::node::{Action, SpecNode};
use crate::state::{SerializedSuite, SpecState};
use crate::{Error, Result, INTERACTIVE_ENV};

/// Controls the behavior of the suite
#[derive(Clone, Default)]
pub struct SuiteOpts {
    /// Skip root-level cleanups (leave the environment running)
    pub no_suite_cleanup: bool,
    /// Skip child-spec cleanups
    pub no_spec_cleanup: bool,
    /// Skip pulling third-party images
    pub no_pull: bool,
    /// Skip loading pulled images into clusters
    pub no_load_pulled: bool,
    /// Skip building custom images
    pub no_build: bool,
    /// Skip loading built images into clusters
    pub no_load_built: bool,
    /// Skip manifests, releases and actions; clusters and images still come up
    pub no_deps: bool,
    /// Remove local image copies after loading them into a cluster
    pub no_cache_images: bool,
    /// Apply `no_cache_images` to no-pull third-party images as well
    pub no_cache_includes_no_pull: bool,
    /// Tag applied to custom images; [`DEFAULT_CUSTOM_IMAGE_TAG`] when absent
    pub custom_image_tag: Option<String>,
    /// Additional tags applied to custom images
    pub extra_custom_image_tags: Vec<String>,
    /// Image handler. Required when any image resource is registered; there
    /// is no shipped default.
    pub images: Option<Arc<dyn Images>>,
    /// Content-addressable puller for image archives absent from disk
    pub registry_puller: Option<Arc<dyn RegistryPuller>>,
    /// Manifest handler; `kubectl` on `$PATH` when absent
    pub manifests: Option<Arc<dyn Manifests>>,
    /// Chart handler; `helm` on `$PATH` when absent
    pub helm: Option<Arc<dyn Helm>>,
    /// Kubectl command seam; `kubectl` on `$PATH` when absent
    pub kubectl: Option<Arc<dyn Kubectl>>,
    /// Bound on concurrently executing nodes; unbounded when absent
    pub max_concurrency: Option<usize>,
    /// Logger directives (tracing `EnvFilter` syntax) applied at construction
    pub log_filter: Option<String>,
}

impl SuiteOpts {
    /// The effective tag for custom images
    pub fn custom_image_tag(&self) -> &str {
        self.custom_image_tag
            .as_deref()
            .unwrap_or(DEFAULT_CUSTOM_IMAGE_TAG)
    }

    pub(crate) fn manifests_backend(&self) -> Arc<dyn Manifests> {
        self.manifests
            .clone()
            .unwrap_or_else(|| Arc::new(KubectlCli::default()))
    }

    pub(crate) fn helm_backend(&self) -> Arc<dyn Helm> {
        self.helm
            .clone()
            .unwrap_or_else(|| Arc::new(HelmCli::default()))
    }

    pub(crate) fn kubectl_backend(&self) -> Arc<dyn Kubectl> {
        self.kubectl
            .clone()
            .unwrap_or_else(|| Arc::new(KubectlCli::default()))
    }
}

impl std::fmt::Debug for SuiteOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuiteOpts")
            .field("no_suite_cleanup", &self.no_suite_cleanup)
            .field("no_spec_cleanup", &self.no_spec_cleanup)
            .field("no_pull", &self.no_pull)
            .field("no_load_pulled", &self.no_load_pulled)
            .field("no_build", &self.no_build)
            .field("no_load_built", &self.no_load_built)
            .field("no_deps", &self.no_deps)
            .field("no_cache_images", &self.no_cache_images)
            .field("no_cache_includes_no_pull", &self.no_cache_includes_no_pull)
            .field("custom_image_tag", &self.custom_image_tag)
            .field("extra_custom_image_tags", &self.extra_custom_image_tags)
            .field("max_concurrency", &self.max_concurrency)
            .field("log_filter", &self.log_filter)
            .finish_non_exhaustive()
    }
}

pub(crate) struct SuiteCore {
    opts: SuiteOpts,
    failed: AtomicBool,
}

/// The orchestrator handle: registration, execution, snapshotting
#[derive(Clone)]
pub struct Kindling {
    suite: Arc<SuiteCore>,
    state: Arc<SpecState>,
}

impl Kindling {
    /// Create a suite with the given options
    pub fn new(opts: SuiteOpts) -> Self {
        if let Some(filter) = &opts.log_filter {
            crate::telemetry::init_logging(Some(filter));
        }
        Self {
            suite: Arc::new(SuiteCore {
                opts,
                failed: AtomicBool::new(false),
            }),
            state: Arc::new(SpecState::new(None)),
        }
    }

    /// The suite's options
    pub fn options(&self) -> &SuiteOpts {
        &self.suite.opts
    }

    pub(crate) fn spec_state(&self) -> &Arc<SpecState> {
        &self.state
    }

    pub(crate) fn images_backend(&self) -> Result<Arc<dyn Images>> {
        self.suite.opts.images.clone().ok_or_else(|| {
            Error::construction("no image handler configured (SuiteOpts::images)")
        })
    }

    /// The effective cleanup gate for this handle's spec-state
    pub(crate) fn no_cleanup(&self) -> bool {
        if self.state.is_root() {
            self.suite.opts.no_suite_cleanup
        } else {
            self.suite.opts.no_spec_cleanup
        }
    }

    /// Mark the suite failed. Consulted by failure-gated cleanups and the
    /// interactive pause.
    pub fn mark_failed(&self) {
        self.suite.failed.store(true, Ordering::SeqCst);
    }

    /// Whether the suite has been marked failed
    pub fn failed(&self) -> bool {
        self.suite.failed.load(Ordering::SeqCst)
    }

    /// The handle registered under a cluster id, if visible from this state
    pub fn cluster_handle(&self, id: &ClusterId) -> Option<Arc<dyn Cluster>> {
        self.state.cluster(&id.0)
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register third-party images to be pulled
    pub fn third_party_images(
        &self,
        images: impl IntoIterator<Item = ThirdPartyImage>,
    ) -> Vec<ThirdPartyImageId> {
        images
            .into_iter()
            .map(|image| {
                let id = new_id();
                self.state.third_party_images.insert(id.clone(), image);
                self.state
                    .third_party_formats
                    .insert(id.clone(), ImageFormat::default());
                self.state.push_node(SpecNode {
                    id: id.clone(),
                    depends_on: Vec::new(),
                    action: Action::PullThirdParty { id: id.clone() },
                });
                ThirdPartyImageId(id)
            })
            .collect()
    }

    /// Register a single third-party image
    pub fn third_party_image(&self, image: ThirdPartyImage) -> ThirdPartyImageId {
        self.third_party_images([image]).remove(0)
    }

    /// Register custom images to be built
    pub fn custom_images(
        &self,
        images: impl IntoIterator<Item = CustomImage>,
    ) -> Vec<CustomImageId> {
        images
            .into_iter()
            .map(|image| {
                let id = new_id();
                self.state.custom_images.insert(id.clone(), image);
                self.state
                    .custom_formats
                    .insert(id.clone(), ImageFormat::default());
                self.state.push_node(SpecNode {
                    id: id.clone(),
                    depends_on: Vec::new(),
                    action: Action::BuildCustom { id: id.clone() },
                });
                CustomImageId(id)
            })
            .collect()
    }

    /// Register a single custom image
    pub fn custom_image(&self, image: CustomImage) -> CustomImageId {
        self.custom_images([image]).remove(0)
    }

    /// Register image archives to be found or fetched
    pub fn image_archives(
        &self,
        archives: impl IntoIterator<Item = ImageArchive>,
    ) -> Vec<ImageArchiveId> {
        archives
            .into_iter()
            .map(|archive| {
                let id = new_id();
                self.state.image_archives.insert(id.clone(), archive);
                self.state.push_node(SpecNode {
                    id: id.clone(),
                    depends_on: Vec::new(),
                    action: Action::PullArchive { id: id.clone() },
                });
                ImageArchiveId(id)
            })
            .collect()
    }

    /// Register a single image archive
    pub fn image_archive(&self, archive: ImageArchive) -> ImageArchiveId {
        self.image_archives([archive]).remove(0)
    }

    /// Register a cluster along with the images it must have loaded.
    ///
    /// One load node is synthesized per image dependency, depending on both
    /// the cluster and the image's pull/build node.
    pub fn cluster(
        &self,
        cluster: Arc<dyn Cluster>,
        deps: &[&dyn ClusterDependency],
    ) -> ClusterId {
        let opts = self.options();
        let cluster_id = new_id();
        self.state.clusters.insert(cluster_id.clone(), cluster);
        self.state
            .third_party_loads
            .insert(cluster_id.clone(), BTreeMap::new());
        self.state
            .custom_loads
            .insert(cluster_id.clone(), BTreeMap::new());
        self.state
            .archive_loads
            .insert(cluster_id.clone(), BTreeMap::new());

        let all = cluster_dependencies(deps);
        for image in &all.third_party_images {
            let descriptor = self.state.third_party_image(&image.0).unwrap_or_else(|| {
                panic!("third-party image {} is not registered", image.0)
            });
            let no_cache = opts.no_cache_images
                && (opts.no_cache_includes_no_pull || !descriptor.no_pull);
            let load_id = new_id();
            self.state
                .third_party_loads
                .get_mut(&cluster_id)
                .expect("load map just inserted")
                .insert(image.0.clone(), load_id.clone());
            self.state.push_node(SpecNode {
                id: load_id,
                depends_on: vec![cluster_id.clone(), image.0.clone()],
                action: Action::LoadThirdParty {
                    cluster: cluster_id.clone(),
                    image: image.0.clone(),
                    no_cache,
                },
            });
        }
        for image in &all.custom_images {
            let load_id = new_id();
            self.state
                .custom_loads
                .get_mut(&cluster_id)
                .expect("load map just inserted")
                .insert(image.0.clone(), load_id.clone());
            self.state.push_node(SpecNode {
                id: load_id,
                depends_on: vec![cluster_id.clone(), image.0.clone()],
                action: Action::LoadCustom {
                    cluster: cluster_id.clone(),
                    image: image.0.clone(),
                    no_cache: opts.no_cache_images,
                },
            });
        }
        for archive in &all.image_archives {
            let load_id = new_id();
            self.state
                .archive_loads
                .get_mut(&cluster_id)
                .expect("load map just inserted")
                .insert(archive.0.clone(), load_id.clone());
            self.state.push_node(SpecNode {
                id: load_id,
                depends_on: vec![cluster_id.clone(), archive.0.clone()],
                action: Action::LoadArchive {
                    cluster: cluster_id.clone(),
                    archive: archive.0.clone(),
                },
            });
        }

        self.state.push_node(SpecNode {
            id: cluster_id.clone(),
            depends_on: Vec::new(),
            action: Action::CreateCluster {
                id: cluster_id.clone(),
            },
        });
        ClusterId(cluster_id)
    }

    fn assert_cluster(&self, cluster: &ClusterId) {
        if !self.state.knows_cluster(&cluster.0) {
            panic!("no cluster with id {}", cluster.0);
        }
    }

    /// Register a manifest set to apply to a cluster
    pub fn manifests(
        &self,
        cluster: &ClusterId,
        set: ManifestSet,
        deps: &[&dyn ResourceDependency],
    ) -> ManifestSetId {
        self.assert_cluster(cluster);
        let id = new_id();
        self.state.manifest_sets.insert(id.clone(), set);
        let mut depends_on = vec![cluster.0.clone()];
        depends_on.extend(
            self.state
                .resolve_resource_deps(&cluster.0, &resource_dependencies(deps)),
        );
        self.state.push_node(SpecNode {
            id: id.clone(),
            depends_on,
            action: Action::ApplyManifests {
                id: id.clone(),
                cluster: cluster.0.clone(),
            },
        });
        ManifestSetId(id)
    }

    /// Register a helm release to install into a cluster
    pub fn release(
        &self,
        cluster: &ClusterId,
        release: HelmRelease,
        deps: &[&dyn ResourceDependency],
    ) -> ReleaseId {
        self.assert_cluster(cluster);
        let id = new_id();
        self.state.releases.insert(id.clone(), release);
        let mut depends_on = vec![cluster.0.clone()];
        depends_on.extend(
            self.state
                .resolve_resource_deps(&cluster.0, &resource_dependencies(deps)),
        );
        self.state.push_node(SpecNode {
            id: id.clone(),
            depends_on,
            action: Action::InstallRelease {
                id: id.clone(),
                cluster: cluster.0.clone(),
            },
        });
        ReleaseId(id)
    }

    /// Register an arbitrary action to run against a cluster
    pub fn cluster_action(
        &self,
        cluster: &ClusterId,
        name: impl Into<String>,
        hooks: ClusterActionHooks,
        deps: &[&dyn ResourceDependency],
    ) -> ClusterActionId {
        self.assert_cluster(cluster);
        let id = new_id();
        self.state.cluster_actions.insert(id.clone(), hooks);
        let mut depends_on = vec![cluster.0.clone()];
        depends_on.extend(
            self.state
                .resolve_resource_deps(&cluster.0, &resource_dependencies(deps)),
        );
        self.state.push_node(SpecNode {
            id: id.clone(),
            depends_on,
            action: Action::UserAction {
                id: id.clone(),
                cluster: cluster.0.clone(),
                name: name.into(),
            },
        });
        ClusterActionId(id)
    }

    /// Branch a child spec-state inheriting this state's clusters
    pub fn for_spec(&self) -> Kindling {
        Kindling {
            suite: self.suite.clone(),
            state: self.state.child(),
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Materialize every registered resource in dependency order.
    ///
    /// Fails fast on the first node error after cancelling the shared
    /// context; completed nodes are remembered for [`Kindling::teardown`].
    pub async fn setup(&self, ctx: &RunContext) -> Result<()> {
        let mut nodes = self
            .state
            .setup
            .lock()
            .expect("setup list lock poisoned")
            .clone();
        self.validate(&nodes)?;

        let releases: Vec<HelmRelease> = self
            .state
            .releases
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let repos = consolidate_repos(releases.iter())?;
        if !repos.is_empty() && !self.options().no_deps {
            let helm = self.options().helm_backend();
            info!(count = repos.len(), "adding chart repositories");
            Job::fan_out(repos.iter().map(|repo| helm.add_repo(ctx, repo)))
                .run()
                .await?;
        }

        if !self.state.is_root() {
            let own: HashSet<String> = nodes.iter().map(|n| n.id.clone()).collect();
            for id in self.state.ancestor_node_ids() {
                if !own.contains(&id) {
                    nodes.push(SpecNode {
                        id,
                        depends_on: Vec::new(),
                        action: Action::Noop,
                    });
                }
            }
        }

        let dag = Dag::build(nodes)?;
        info!(nodes = dag.len(), "running environment setup");
        let executor = Executor {
            max_concurrency: self.options().max_concurrency,
        };
        // fail-fast cancels a derived context so the author's own context
        // stays live for the interactive pause and outer coordination
        let run_ctx = ctx.child();
        match executor.run_setup(dag, self, &run_ctx).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.mark_failed();
                Err(err)
            }
        }
    }

    /// Checks that must hold before any action runs
    fn validate(&self, nodes: &[SpecNode]) -> Result<()> {
        if self.options().images.is_none() {
            for node in nodes {
                let needs_handler = match &node.action {
                    Action::PullThirdParty { .. }
                    | Action::LoadThirdParty { .. }
                    | Action::LoadCustom { .. } => true,
                    Action::BuildCustom { id } => self
                        .state
                        .custom_image(id)
                        .map(|image| image.builder.is_none())
                        .unwrap_or(true),
                    _ => false,
                };
                if needs_handler {
                    return Err(Error::construction_for(
                        node.id.clone(),
                        "image resources are registered but no image handler is \
                         configured (SuiteOpts::images)",
                    ));
                }
            }
        }

        // a no-cache load deletes the local copy, so a second cluster would
        // have nothing left to load
        let mut no_cache_loads: HashMap<&str, usize> = HashMap::new();
        for node in nodes {
            if let Action::LoadThirdParty {
                image,
                no_cache: true,
                ..
            }
            | Action::LoadCustom {
                image,
                no_cache: true,
                ..
            } = &node.action
            {
                *no_cache_loads.entry(image.as_str()).or_default() += 1;
            }
        }
        for (image, count) in no_cache_loads {
            if count > 1 {
                return Err(Error::construction_for(
                    image.to_string(),
                    format!(
                        "no-cache image is set to load to {} clusters in the same \
                         spec-state; a no-cache load removes the local copy",
                        count
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Tear down everything that completed setup, in reverse dependency
    /// order under a fresh context. Errors are reported and collected, never
    /// fatal.
    ///
    /// When the suite has failed and the interactive environment variable is
    /// set, teardown pauses until `setup_ctx` is cancelled so the author can
    /// poke at the still-live environment.
    pub async fn teardown(&self, setup_ctx: &RunContext) -> Vec<Error> {
        if self.failed() && std::env::var(INTERACTIVE_ENV).is_ok() {
            info!(
                env = INTERACTIVE_ENV,
                "suite failed and interactive mode is set; pausing cleanup until cancelled"
            );
            setup_ctx.cancelled().await;
        }

        let completed: Vec<SpecNode> = {
            let mut log = self
                .state
                .cleanup
                .lock()
                .expect("cleanup log lock poisoned");
            std::mem::take(&mut *log)
        };
        if completed.is_empty() {
            return Vec::new();
        }

        info!(nodes = completed.len(), "running environment teardown");
        let dag = Dag::reversed_over(completed);
        let executor = Executor {
            max_concurrency: self.options().max_concurrency,
        };
        let fresh = RunContext::new();
        let errors = executor.run_cleanup(dag, self, &fresh).await;
        for err in &errors {
            error!(error = %err, "cleanup failed");
        }
        errors
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Snapshot this state chain's cluster handles as JSON for parallel
    /// workers. The chosen cluster ids are recorded in order.
    pub fn serialize(&self, ids: &[ClusterId]) -> Result<String> {
        for id in ids {
            if !self.state.knows_cluster(&id.0) {
                return Err(Error::serialization(format!(
                    "cluster {} is not visible from this spec-state",
                    id.0
                )));
            }
        }
        let mut specs = Vec::new();
        let mut current = Some(self.state.clone());
        while let Some(state) = current {
            specs.push(state.snapshot());
            current = state.parent.clone();
        }
        let suite = SerializedSuite {
            specs,
            cluster_ids: ids.iter().map(|id| id.0.clone()).collect(),
        };
        serde_json::to_string(&suite).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Rebuild a suite from a snapshot. Every cluster becomes a passive
    /// handle serving the recorded connection data; lifecycle calls panic.
    pub fn deserialize(opts: SuiteOpts, json: &str) -> Result<(Kindling, Vec<ClusterId>)> {
        let suite: SerializedSuite =
            serde_json::from_str(json).map_err(|e| Error::serialization(e.to_string()))?;

        let mut state: Option<Arc<SpecState>> = None;
        for spec in suite.specs.iter().rev() {
            let next = SpecState::new(state.take());
            for (id, cluster) in &spec.clusters {
                next.clusters.insert(id.clone(), Arc::new(cluster.clone()));
            }
            state = Some(Arc::new(next));
        }
        let leaf = state.unwrap_or_else(|| Arc::new(SpecState::new(None)));

        let harness = Kindling {
            suite: Arc::new(SuiteCore {
                opts,
                failed: AtomicBool::new(false),
            }),
            state: leaf,
        };
        let ids = suite.cluster_ids.into_iter().map(ClusterId).collect();
        Ok((harness, ids))
    }
}

impl std::fmt::Debug for Kindling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kindling")
            .field("root", &self.state.is_root())
            .field("failed", &self.failed())
            .finish_non_exhaustive()
    }
}

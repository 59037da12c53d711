//! kindling: test-environment orchestration for ephemeral Kubernetes
//! environments
//!
//! Integration suites register *resources* — container images to pull or
//! build, clusters to create, image archives, raw manifests, chart releases,
//! and arbitrary actions — together with the dependencies between them. The
//! orchestrator materializes everything in topological order, concurrently
//! wherever the graph allows, and tears it all down in reverse order when
//! the suite (or an individual test's child spec) finishes.
//!
//! ```ignore
//! use kindling::{Kindling, RunContext, SuiteOpts, ThirdPartyImage, HelmRelease};
//!
//! let g = Kindling::new(SuiteOpts::default());
//! let image = g.third_party_image(ThirdPartyImage::new("docker.io/bitnami/mariadb:10.6"));
//! let cluster = g.cluster(my_cluster_handle, &[&image]);
//! g.release(&cluster, my_release, &[&image]);
//!
//! let ctx = RunContext::new();
//! g.setup(&ctx).await?;
//! // ... run tests ...
//! g.teardown(&ctx).await;
//! ```
//!
//! Cluster handles and image builders are author-supplied (see
//! [`Cluster`] and [`Images`]); manifest and chart handling default to
//! `kubectl` and `helm` on `$PATH`.

#![deny(missing_docs)]

mod actions;
mod cluster;
mod dag;
mod deps;
mod error;
mod helm;
mod id;
mod images;
mod job;
mod kubectl;
mod manifests;
mod node;
mod state;
mod suite;
mod telemetry;
mod util;
mod value;

pub use actions::{cluster_action_fn, ClusterActionFn, ClusterActionHooks, Daemon};
pub use cluster::{cluster_temp_path, Cluster, KubernetesConnection, NoopCluster, SerializedCluster};
pub use deps::{
    cluster_dependencies, resource_dependencies, ClusterDependencies, ClusterDependency,
    ResourceDependencies, ResourceDependency, NO_DEPENDENCIES,
};
pub use error::Error;
pub use helm::{
    resolve_set_args, ChartLocation, Helm, HelmChart, HelmCli, HelmRelease, HelmRepo,
    LocalChartInfo, OciChartInfo, RemoteChartInfo,
};
pub use id::{
    ClusterActionId, ClusterId, CustomImageId, ImageArchiveId, ManifestSetId, ReleaseId,
    ThirdPartyImageId,
};
pub use images::{
    CustomImage, ImageArchive, ImageFormat, Images, RegistryPuller, ThirdPartyImage,
    DEFAULT_CUSTOM_IMAGE_TAG,
};
pub use job::{Job, RunContext};
pub use kubectl::{Kubectl, KubectlCli};
pub use manifests::{AppliedObjects, ManifestSet, Manifests, WaitFor};
pub use suite::{Kindling, SuiteOpts};
pub use telemetry::init_logging;
pub use util::{with_random_port, with_random_ports, MultiSuiteLock};
pub use value::{
    resolve_nested_object, Deferred, NestedObject, NestedValue, Object, ObjectExt, Value,
    ValueContext,
};

/// Result type alias using the crate's error type
pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable that pauses teardown of a failed suite until the run
/// context is cancelled, leaving the environment alive for inspection
pub const INTERACTIVE_ENV: &str = "KINDLING_INTERACTIVE";

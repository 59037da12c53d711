//! The cluster provider contract and its wrappers
//!
//! Cluster handles are author-supplied: the orchestrator never constructs
//! one. Anything that can create a kubernetes API surface, transfer images
//! into it, and tear it down can back a suite — a local container-based
//! cluster, an in-process control plane, or a passive handle rehydrated from
//! a serialized snapshot.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::images::{ImageFormat, Images};
use crate::job::{Job, RunContext};

/// A connection to a kubernetes API server
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesConnection {
    /// Path to a kubeconfig file. If absent, the default loading rules are
    /// used.
    #[serde(rename = "Kubeconfig", default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    /// The context within the kubeconfig file to use. If absent, the current
    /// context is used.
    #[serde(rename = "Context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Knows how to manage a temporary cluster
pub trait Cluster: Send + Sync {
    /// Create the cluster. If `skip_existing` is set, an already-existing
    /// cluster is not an error.
    fn create(&self, ctx: &RunContext, skip_existing: bool) -> Job;

    /// The kubeconfig and context to use to reach the cluster's API server.
    /// Must not fail; anything fallible belongs in `create`.
    fn connection(&self) -> KubernetesConnection;

    /// A directory for temporary files related to this cluster. Must return
    /// the same value every time it is called.
    fn temp_dir(&self) -> PathBuf;

    /// A descriptive name for this cluster
    fn name(&self) -> String;

    /// Load a set of images of a given format from an image source. When
    /// `no_cache` is set, local copies of the images must be removed after
    /// the transfer.
    ///
    /// Multiple load calls may be in flight concurrently.
    fn load_images(
        &self,
        ctx: &RunContext,
        from: Arc<dyn Images>,
        format: ImageFormat,
        images: &[String],
        no_cache: bool,
    ) -> Job;

    /// Load a set of image archives of a given format from the filesystem
    fn load_image_archives(&self, ctx: &RunContext, format: ImageFormat, archives: &[PathBuf])
        -> Job;

    /// Delete the cluster. Must not fail if the cluster is absent.
    fn delete(&self, ctx: &RunContext) -> Job;
}

/// Path under a cluster's temp dir for a named group of temporary files
pub fn cluster_temp_path(cluster: &dyn Cluster, group: &str, parts: &[&str]) -> PathBuf {
    let mut path = cluster.temp_dir().join(group);
    for part in parts {
        path = path.join(part);
    }
    path
}

/// Wraps a parent-suite cluster for use inside a child spec.
///
/// Create and delete become no-ops — the parent owns the cluster's lifetime —
/// while every other method delegates.
pub struct NoopCluster {
    inner: Arc<dyn Cluster>,
}

impl NoopCluster {
    /// Wrap an inherited cluster handle
    pub fn new(inner: Arc<dyn Cluster>) -> Self {
        Self { inner }
    }
}

impl Cluster for NoopCluster {
    fn create(&self, _ctx: &RunContext, _skip_existing: bool) -> Job {
        Job::noop()
    }

    fn connection(&self) -> KubernetesConnection {
        self.inner.connection()
    }

    fn temp_dir(&self) -> PathBuf {
        self.inner.temp_dir()
    }

    fn name(&self) -> String {
        self.inner.name()
    }

    fn load_images(
        &self,
        ctx: &RunContext,
        from: Arc<dyn Images>,
        format: ImageFormat,
        images: &[String],
        no_cache: bool,
    ) -> Job {
        self.inner.load_images(ctx, from, format, images, no_cache)
    }

    fn load_image_archives(
        &self,
        ctx: &RunContext,
        format: ImageFormat,
        archives: &[PathBuf],
    ) -> Job {
        self.inner.load_image_archives(ctx, format, archives)
    }

    fn delete(&self, _ctx: &RunContext) -> Job {
        Job::noop()
    }
}

/// A passive cluster handle rehydrated from a serialized snapshot.
///
/// Parallel test workers receive these instead of live handles: connection
/// data is served from the snapshot, while lifecycle methods panic — a
/// worker must never create, mutate or delete the shared environment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedCluster {
    /// Connection data captured at serialization time
    #[serde(rename = "Connection")]
    pub connection: KubernetesConnection,
    /// The original handle's temp dir
    #[serde(rename = "TempDir")]
    pub temp_dir: PathBuf,
    /// The original handle's name
    #[serde(rename = "Name")]
    pub name: String,
}

impl Cluster for SerializedCluster {
    fn create(&self, _ctx: &RunContext, _skip_existing: bool) -> Job {
        panic!("create is not supported on a rehydrated cluster handle");
    }

    fn connection(&self) -> KubernetesConnection {
        self.connection.clone()
    }

    fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn load_images(
        &self,
        _ctx: &RunContext,
        _from: Arc<dyn Images>,
        _format: ImageFormat,
        _images: &[String],
        _no_cache: bool,
    ) -> Job {
        panic!("load_images is not supported on a rehydrated cluster handle");
    }

    fn load_image_archives(
        &self,
        _ctx: &RunContext,
        _format: ImageFormat,
        _archives: &[PathBuf],
    ) -> Job {
        panic!("load_image_archives is not supported on a rehydrated cluster handle");
    }

    fn delete(&self, _ctx: &RunContext) -> Job {
        panic!("delete is not supported on a rehydrated cluster handle");
    }
}

impl SerializedCluster {
    /// Snapshot a live handle's identity
    pub(crate) fn snapshot(cluster: &dyn Cluster) -> Self {
        Self {
            connection: cluster.connection(),
            temp_dir: cluster.temp_dir(),
            name: cluster.name(),
        }
    }
}

/// Build kubeconfig/context arguments shared by the CLI backends
pub(crate) fn connection_args(conn: &KubernetesConnection) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(kubeconfig) = &conn.kubeconfig {
        args.push("--kubeconfig".to_string());
        args.push(kubeconfig.display().to_string());
    }
    if let Some(context) = &conn.context {
        args.push("--context".to_string());
        args.push(context.clone());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubCluster;

    impl Cluster for StubCluster {
        fn create(&self, _ctx: &RunContext, _skip_existing: bool) -> Job {
            Job::fail(crate::Error::setup("create", "should not run"))
        }
        fn connection(&self) -> KubernetesConnection {
            KubernetesConnection {
                kubeconfig: Some(PathBuf::from("/tmp/stub/kubeconfig")),
                context: Some("stub".to_string()),
            }
        }
        fn temp_dir(&self) -> PathBuf {
            PathBuf::from("/tmp/stub")
        }
        fn name(&self) -> String {
            "stub".to_string()
        }
        fn load_images(
            &self,
            _ctx: &RunContext,
            _from: Arc<dyn Images>,
            _format: ImageFormat,
            _images: &[String],
            _no_cache: bool,
        ) -> Job {
            Job::noop()
        }
        fn load_image_archives(
            &self,
            _ctx: &RunContext,
            _format: ImageFormat,
            _archives: &[PathBuf],
        ) -> Job {
            Job::noop()
        }
        fn delete(&self, _ctx: &RunContext) -> Job {
            Job::fail(crate::Error::setup("delete", "should not run"))
        }
    }

    /// Story: a child spec can name an inherited cluster without owning it
    ///
    /// The no-op wrapper lets the child's create-cluster node succeed
    /// instantly while keeping connection data intact.
    #[tokio::test]
    async fn story_noop_wrapper_neutralizes_lifecycle() {
        let ctx = RunContext::new();
        let wrapped = NoopCluster::new(Arc::new(StubCluster));

        // create and delete are inert even though the inner handle would fail
        wrapped.create(&ctx, true).run().await.unwrap();
        wrapped.delete(&ctx).run().await.unwrap();

        // identity still delegates
        assert_eq!(wrapped.name(), "stub");
        assert_eq!(
            wrapped.connection().context.as_deref(),
            Some("stub")
        );
    }

    #[test]
    fn test_cluster_temp_path_nests_groups() {
        let path = cluster_temp_path(&StubCluster, "helm", &["releases", "db", "values"]);
        assert_eq!(
            path,
            PathBuf::from("/tmp/stub/helm/releases/db/values")
        );
    }

    #[test]
    fn test_serialized_cluster_round_trip() {
        let snapshot = SerializedCluster::snapshot(&StubCluster);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"Kubeconfig\""));
        let back: SerializedCluster = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
        assert_eq!(back.name(), "stub");
    }

    #[test]
    #[should_panic(expected = "not supported")]
    fn test_serialized_cluster_panics_on_lifecycle() {
        let snapshot = SerializedCluster::snapshot(&StubCluster);
        let _ = snapshot.create(&RunContext::new(), true);
    }

    #[test]
    fn test_connection_args() {
        let args = connection_args(&StubCluster.connection());
        assert_eq!(
            args,
            vec!["--kubeconfig", "/tmp/stub/kubeconfig", "--context", "stub"]
        );
        assert!(connection_args(&KubernetesConnection::default()).is_empty());
    }
}

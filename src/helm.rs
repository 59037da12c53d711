//! Chart, repo and release descriptors, the chart-handling contract, and the
//! `helm`-CLI backend
//!
//! Releases reference charts from one of three locations: a local directory
//! or tarball, a remote chart repository, or an OCI registry. Before any
//! setup node runs, the orchestrator consolidates the remote repositories
//! used by a spec-state's releases and issues one parallel `repo add` burst;
//! two releases naming the same repo alias with different definitions is a
//! construction error.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::process::Command;
use tracing::debug;

use crate::cluster::{cluster_temp_path, connection_args, Cluster, KubernetesConnection};
use crate::job::{run_command, Job, RunContext};
use crate::manifests::WaitFor;
use crate::suite::Kindling;
use crate::value::{resolve_nested_object, NestedObject, Object, ValueContext};
use crate::{Error, Result};

/// A repository to pull helm charts from
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HelmRepo {
    /// The alias used in `repo add`
    pub name: String,
    /// The URL provided to `repo add`
    pub url: String,
    /// Extra flags for the `repo add` command
    pub flags: Vec<String>,
    /// Run `repo update` for this alias after adding it
    pub update: bool,
}

impl HelmRepo {
    /// A plain repo alias
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ..Default::default()
        }
    }
}

/// A chart from a local directory or tarball
#[derive(Clone, Debug, Default)]
pub struct LocalChartInfo {
    /// Path to the chart directory or tarball
    pub path: PathBuf,
    /// Run `dependency update` before installing
    pub dependency_update: bool,
}

/// A chart from a remote repository
#[derive(Clone, Debug)]
pub struct RemoteChartInfo {
    /// Chart name within the repository
    pub name: String,
    /// The repository serving the chart
    pub repo: HelmRepo,
    /// Chart version; latest when absent
    pub version: Option<String>,
}

/// A chart from an OCI registry
#[derive(Clone, Debug)]
pub struct OciChartInfo {
    /// Registry hostname
    pub registry: String,
    /// Repository within the registry
    pub repository: String,
    /// Chart version; latest when absent
    pub version: Option<String>,
}

/// Where a chart comes from
#[derive(Clone, Debug)]
pub enum ChartLocation {
    /// A local directory or tarball
    Local(LocalChartInfo),
    /// A remote chart repository
    Remote(RemoteChartInfo),
    /// An OCI registry
    Oci(OciChartInfo),
}

impl Default for ChartLocation {
    fn default() -> Self {
        ChartLocation::Local(LocalChartInfo::default())
    }
}

/// A chart to be installed
#[derive(Clone, Debug, Default)]
pub struct HelmChart {
    /// Where the chart comes from
    pub location: ChartLocation,
    /// Extra flags passed to `upgrade` for every release of this chart
    pub upgrade_flags: Vec<String>,
}

impl HelmChart {
    /// A chart from a local path
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            location: ChartLocation::Local(LocalChartInfo {
                path: path.into(),
                dependency_update: false,
            }),
            upgrade_flags: Vec::new(),
        }
    }

    /// A chart from a remote repository
    pub fn remote(repo: HelmRepo, name: impl Into<String>, version: Option<String>) -> Self {
        Self {
            location: ChartLocation::Remote(RemoteChartInfo {
                name: name.into(),
                repo,
                version,
            }),
            upgrade_flags: Vec::new(),
        }
    }

    /// A chart from an OCI registry
    pub fn oci(
        registry: impl Into<String>,
        repository: impl Into<String>,
        version: Option<String>,
    ) -> Self {
        Self {
            location: ChartLocation::Oci(OciChartInfo {
                registry: registry.into(),
                repository: repository.into(),
                version,
            }),
            upgrade_flags: Vec::new(),
        }
    }

    /// Whether the chart lives on the local filesystem
    pub fn is_local(&self) -> bool {
        matches!(self.location, ChartLocation::Local(_))
    }

    /// Whether the chart lives in an OCI registry
    pub fn is_oci(&self) -> bool {
        matches!(self.location, ChartLocation::Oci(_))
    }

    /// The chart reference as passed to `helm upgrade`
    pub fn fullname(&self) -> String {
        match &self.location {
            ChartLocation::Local(info) => {
                let path = info.path.display().to_string();
                if info.path.is_absolute() || path.starts_with("./") || path.starts_with("../") {
                    path
                } else {
                    format!("./{}", path)
                }
            }
            ChartLocation::Remote(info) => format!("{}/{}", info.repo.name, info.name),
            ChartLocation::Oci(info) => format!("oci://{}/{}", info.registry, info.repository),
        }
    }

    /// The version to install; local charts have none
    pub fn version(&self) -> Option<&str> {
        match &self.location {
            ChartLocation::Local(_) => None,
            ChartLocation::Remote(info) => info.version.as_deref(),
            ChartLocation::Oci(info) => info.version.as_deref(),
        }
    }
}

/// A chart to be released into a cluster
#[derive(Clone, Debug, Default)]
pub struct HelmRelease {
    /// Release name
    pub name: String,
    /// Release namespace; the connection's default when absent
    pub namespace: Option<String>,
    /// The chart to release
    pub chart: HelmChart,
    /// `--set` arguments; values may be deferred
    pub set: Object,
    /// `--set-string` arguments
    pub set_string: BTreeMap<String, String>,
    /// `--set-file` arguments
    pub set_file: BTreeMap<String, PathBuf>,
    /// Files provided with `--values`
    pub values_files: Vec<PathBuf>,
    /// Objects serialized as YAML files and provided with `--values`;
    /// deferred values are resolved first
    pub values: Vec<NestedObject>,
    /// Extra arguments passed to both upgrade and delete
    pub extra_flags: Vec<String>,
    /// Extra arguments passed to upgrade only
    pub upgrade_flags: Vec<String>,
    /// Extra arguments passed to delete only
    pub delete_flags: Vec<String>,
    /// Conditions to wait on after the install completes
    pub wait: Vec<WaitFor>,
    /// Skip helm's own `--wait`
    pub no_wait: bool,
    /// Leave the release in place during cleanup
    pub skip_delete: bool,
}

/// Knows how to install and uninstall helm charts
pub trait Helm: Send + Sync {
    /// Add (and optionally update) a chart repository
    fn add_repo(&self, ctx: &RunContext, repo: &HelmRepo) -> Job;

    /// Install or upgrade a release into a cluster
    fn install_or_upgrade(
        &self,
        harness: &Kindling,
        ctx: &RunContext,
        cluster: Arc<dyn Cluster>,
        release: &HelmRelease,
    ) -> Job;

    /// Remove a release from a cluster. When `skip_not_exists` is set, an
    /// absent release is not an error.
    fn delete(
        &self,
        ctx: &RunContext,
        cluster: Arc<dyn Cluster>,
        release: &HelmRelease,
        skip_not_exists: bool,
    ) -> Job;
}

/// Resolve a release's `set` map into encoded `key=value` pairs, calling any
/// deferred values with the release's owning cluster.
///
/// Shared by the CLI backend and custom [`Helm`] implementations so every
/// backend encodes identically.
pub async fn resolve_set_args(
    harness: &Kindling,
    ctx: &RunContext,
    cluster: &Arc<dyn Cluster>,
    release: &HelmRelease,
) -> Result<Vec<(String, String)>> {
    let cx = ValueContext {
        harness: harness.clone(),
        ctx: ctx.clone(),
        cluster: cluster.clone(),
    };
    let mut args = Vec::with_capacity(release.set.len());
    for (key, value) in &release.set {
        args.push((key.clone(), value.resolve_set_arg(&cx).await?));
    }
    Ok(args)
}

/// Compute the unique set of remote repos used by the given releases.
///
/// Two releases naming the same alias must agree on the full repo
/// definition.
pub(crate) fn consolidate_repos<'a>(
    releases: impl IntoIterator<Item = &'a HelmRelease>,
) -> Result<Vec<HelmRepo>> {
    let mut repos: BTreeMap<String, (HelmRepo, String)> = BTreeMap::new();
    for release in releases {
        if let ChartLocation::Remote(info) = &release.chart.location {
            match repos.get(&info.repo.name) {
                None => {
                    repos.insert(
                        info.repo.name.clone(),
                        (info.repo.clone(), release.name.clone()),
                    );
                }
                Some((existing, first)) => {
                    if existing != &info.repo {
                        return Err(Error::construction(format!(
                            "releases {} and {} declare incompatible definitions \
                             for chart repo {}",
                            first, release.name, info.repo.name
                        )));
                    }
                }
            }
        }
    }
    Ok(repos.into_values().map(|(repo, _)| repo).collect())
}

/// Drives the `helm` binary
#[derive(Clone, Debug, Default)]
pub struct HelmCli {
    /// The command to execute; `helm` on `$PATH` when empty
    pub command: Vec<String>,
}

impl HelmCli {
    fn helm(&self, conn: &KubernetesConnection, args: &[String]) -> Command {
        let mut argv: Vec<String> = if self.command.is_empty() {
            vec!["helm".to_string()]
        } else {
            self.command.clone()
        };
        argv.extend(connection_args(conn));
        argv.extend(args.iter().cloned());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd
    }
}

impl Helm for HelmCli {
    fn add_repo(&self, ctx: &RunContext, repo: &HelmRepo) -> Job {
        let mut args = vec![
            "repo".to_string(),
            "add".to_string(),
            repo.name.clone(),
            repo.url.clone(),
        ];
        args.extend(repo.flags.iter().cloned());
        let add = Job::command(ctx, self.helm(&KubernetesConnection::default(), &args));
        if !repo.update {
            return add;
        }
        let update_args = vec!["repo".to_string(), "update".to_string(), repo.name.clone()];
        let update = Job::command(ctx, self.helm(&KubernetesConnection::default(), &update_args));
        Job::and([add, update])
    }

    fn install_or_upgrade(
        &self,
        harness: &Kindling,
        ctx: &RunContext,
        cluster: Arc<dyn Cluster>,
        release: &HelmRelease,
    ) -> Job {
        let this = self.clone();
        let harness = harness.clone();
        let ctx = ctx.clone();
        let release = release.clone();
        Job::from_future(async move {
            let conn = cluster.connection();

            let mut args = vec![
                "upgrade".to_string(),
                "--install".to_string(),
                release.name.clone(),
                release.chart.fullname(),
            ];
            if !release.no_wait {
                args.push("--wait".to_string());
            }
            if let Some(version) = release.chart.version() {
                args.push("--version".to_string());
                args.push(version.to_string());
            }
            args.extend(release.chart.upgrade_flags.iter().cloned());
            args.extend(release.extra_flags.iter().cloned());
            args.extend(release.upgrade_flags.iter().cloned());
            if let Some(namespace) = &release.namespace {
                args.push("--namespace".to_string());
                args.push(namespace.clone());
            }

            for (key, value) in resolve_set_args(&harness, &ctx, &cluster, &release).await? {
                args.push("--set".to_string());
                args.push(format!("{}={}", key, value));
            }
            for (key, value) in &release.set_string {
                args.push("--set-string".to_string());
                args.push(format!("{}={}", key, value));
            }
            for (key, path) in &release.set_file {
                args.push("--set-file".to_string());
                args.push(format!("{}={}", key, path.display()));
            }
            for path in &release.values_files {
                args.push("--values".to_string());
                args.push(path.display().to_string());
            }

            if !release.values.is_empty() {
                let namespace_part = release.namespace.as_deref().unwrap_or("_DEFAULT_");
                let value_dir = cluster_temp_path(
                    cluster.as_ref(),
                    "helm",
                    &["releases", namespace_part, &release.name, "values"],
                );
                tokio::fs::create_dir_all(&value_dir)
                    .await
                    .map_err(|e| Error::io(value_dir.display().to_string(), e))?;

                let cx = ValueContext {
                    harness: harness.clone(),
                    ctx: ctx.clone(),
                    cluster: cluster.clone(),
                };
                for (ix, object) in release.values.iter().enumerate() {
                    let resolved = resolve_nested_object(object, &cx).await?;
                    let yaml = serde_yaml::to_string(&resolved)
                        .map_err(|e| Error::serialization(e.to_string()))?;
                    let path = value_dir.join(format!("{}.yaml", ix));
                    tokio::fs::write(&path, yaml)
                        .await
                        .map_err(|e| Error::io(path.display().to_string(), e))?;
                    args.push("--values".to_string());
                    args.push(path.display().to_string());
                }
            }

            if let ChartLocation::Local(info) = &release.chart.location {
                if info.dependency_update {
                    let dep_args = vec![
                        "dependency".to_string(),
                        "update".to_string(),
                        release.chart.fullname(),
                    ];
                    run_command(&ctx, this.helm(&conn, &dep_args), None).await?;
                }
            }

            run_command(&ctx, this.helm(&conn, &args), None).await?;

            if !release.wait.is_empty() {
                harness
                    .kubectl_wait(&ctx, cluster.clone(), &release.wait)
                    .run()
                    .await?;
            }
            Ok(())
        })
    }

    fn delete(
        &self,
        ctx: &RunContext,
        cluster: Arc<dyn Cluster>,
        release: &HelmRelease,
        skip_not_exists: bool,
    ) -> Job {
        let mut args = vec![
            "delete".to_string(),
            release.name.clone(),
            "--wait".to_string(),
        ];
        if let Some(namespace) = &release.namespace {
            args.push("--namespace".to_string());
            args.push(namespace.clone());
        }
        args.extend(release.extra_flags.iter().cloned());
        args.extend(release.delete_flags.iter().cloned());

        let cmd = self.helm(&cluster.connection(), &args);
        let ctx = ctx.clone();
        let name = release.name.clone();
        Job::from_future(async move {
            match run_command(&ctx, cmd, None).await {
                Ok(_) => Ok(()),
                Err(Error::Command { message, .. })
                    if skip_not_exists && message.contains("not found") =>
                {
                    debug!(release = %name, "release already absent, nothing to delete");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release_with_repo(release: &str, repo: HelmRepo) -> HelmRelease {
        HelmRelease {
            name: release.to_string(),
            chart: HelmChart::remote(repo, "app", Some("1.2.3".to_string())),
            ..Default::default()
        }
    }

    mod chart_location {
        use super::*;

        /// Story: helm needs `./` to tell a local path from a repo ref
        #[test]
        fn local_relative_paths_get_dot_slash() {
            assert_eq!(HelmChart::local("charts/app").fullname(), "./charts/app");
            assert_eq!(HelmChart::local("./charts/app").fullname(), "./charts/app");
            assert_eq!(HelmChart::local("../shared/app").fullname(), "../shared/app");
            assert_eq!(HelmChart::local("/abs/app").fullname(), "/abs/app");
        }

        #[test]
        fn remote_fullname_is_alias_slash_name() {
            let chart = HelmChart::remote(HelmRepo::new("bitnami", "https://example"), "mariadb", None);
            assert_eq!(chart.fullname(), "bitnami/mariadb");
            assert!(!chart.is_local());
            assert!(!chart.is_oci());
        }

        #[test]
        fn oci_fullname_has_scheme() {
            let chart = HelmChart::oci("ghcr.io", "org/charts/app", Some("2.0.0".to_string()));
            assert_eq!(chart.fullname(), "oci://ghcr.io/org/charts/app");
            assert!(chart.is_oci());
        }

        #[test]
        fn version_resolves_from_remote_and_oci_only() {
            assert_eq!(HelmChart::local("x").version(), None);
            assert_eq!(
                HelmChart::remote(HelmRepo::default(), "x", Some("1.0".to_string())).version(),
                Some("1.0")
            );
            assert_eq!(
                HelmChart::oci("h", "r", Some("2.0".to_string())).version(),
                Some("2.0")
            );
        }
    }

    mod repo_consolidation {
        use super::*;

        #[test]
        fn unique_repos_are_collected_once() {
            let bitnami = HelmRepo::new("bitnami", "https://charts.example/bitnami");
            let jetstack = HelmRepo::new("jetstack", "https://charts.example/jetstack");
            let releases = [
                release_with_repo("a", bitnami.clone()),
                release_with_repo("b", bitnami.clone()),
                release_with_repo("c", jetstack),
            ];
            let repos = consolidate_repos(releases.iter()).unwrap();
            assert_eq!(repos.len(), 2);
        }

        #[test]
        fn local_charts_contribute_nothing() {
            let releases = [HelmRelease {
                name: "local".to_string(),
                chart: HelmChart::local("./chart"),
                ..Default::default()
            }];
            assert!(consolidate_repos(releases.iter()).unwrap().is_empty());
        }

        /// Story: one alias, one definition
        ///
        /// Two releases that both say "bitnami" but point at different URLs
        /// would race on `repo add`; this is caught before anything runs.
        #[test]
        fn story_conflicting_urls_for_one_alias_fail_construction() {
            let releases = [
                release_with_repo("a", HelmRepo::new("bitnami", "https://one.example")),
                release_with_repo("b", HelmRepo::new("bitnami", "https://two.example")),
            ];
            let err = consolidate_repos(releases.iter()).unwrap_err();
            let msg = err.to_string();
            assert!(msg.contains("construction"));
            assert!(msg.contains("bitnami"));
            assert!(msg.contains('a') && msg.contains('b'));
        }
    }

    #[test]
    fn test_helm_cli_command_override() {
        let cli = HelmCli {
            command: vec!["helm3".to_string(), "--debug".to_string()],
        };
        let cmd = cli.helm(
            &KubernetesConnection {
                kubeconfig: Some(PathBuf::from("/tmp/kc")),
                context: None,
            },
            &["version".to_string()],
        );
        let line = crate::job::describe_command(&cmd);
        assert_eq!(line, "helm3 --debug --kubeconfig /tmp/kc version");
    }
}

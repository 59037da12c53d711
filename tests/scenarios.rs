//! Scenario tests against the public API
//!
//! Every test drives the orchestrator with in-memory fake backends that
//! record an ordered event timeline; assertions are about what ran, what
//! didn't, and in which order.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kindling::{
    Cluster, ClusterActionHooks, CustomImage, Daemon, HelmChart, HelmRelease, HelmRepo, Images,
    ImageFormat, Job, Kindling, KubernetesConnection, ManifestSet, Manifests, RunContext,
    SuiteOpts, ThirdPartyImage, Value, NO_DEPENDENCIES,
};

/// Shared, ordered record of everything the fakes did
#[derive(Clone, Default)]
struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    fn contains(&self, event: &str) -> bool {
        self.count(event) > 0
    }

    fn position(&self, event: &str) -> usize {
        let events = self.events();
        events
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event {:?} not recorded; got {:?}", event, events))
    }

    fn assert_before(&self, earlier: &str, later: &str) {
        assert!(
            self.position(earlier) < self.position(later),
            "expected {:?} before {:?}; timeline: {:?}",
            earlier,
            later,
            self.events()
        );
    }
}

struct FakeCluster {
    name: String,
    log: EventLog,
}

impl FakeCluster {
    fn named(name: &str, log: &EventLog) -> Arc<dyn Cluster> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
        })
    }
}

impl Cluster for FakeCluster {
    fn create(&self, _ctx: &RunContext, _skip_existing: bool) -> Job {
        let log = self.log.clone();
        let name = self.name.clone();
        Job::from_fn(move || {
            log.record(format!("create:{}", name));
            Ok(())
        })
    }

    fn connection(&self) -> KubernetesConnection {
        KubernetesConnection {
            kubeconfig: Some(PathBuf::from(format!("/tmp/{}/kubeconfig", self.name))),
            context: Some(self.name.clone()),
        }
    }

    fn temp_dir(&self) -> PathBuf {
        PathBuf::from("/tmp").join(&self.name)
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn load_images(
        &self,
        _ctx: &RunContext,
        _from: Arc<dyn Images>,
        _format: ImageFormat,
        images: &[String],
        no_cache: bool,
    ) -> Job {
        let log = self.log.clone();
        let name = self.name.clone();
        let images = images.to_vec();
        Job::from_fn(move || {
            for image in images {
                if no_cache {
                    log.record(format!("load-nocache:{}@{}", image, name));
                } else {
                    log.record(format!("load:{}@{}", image, name));
                }
            }
            Ok(())
        })
    }

    fn load_image_archives(
        &self,
        _ctx: &RunContext,
        _format: ImageFormat,
        archives: &[PathBuf],
    ) -> Job {
        let log = self.log.clone();
        let name = self.name.clone();
        let archives = archives.to_vec();
        Job::from_fn(move || {
            for archive in archives {
                log.record(format!("load-archive:{}@{}", archive.display(), name));
            }
            Ok(())
        })
    }

    fn delete(&self, _ctx: &RunContext) -> Job {
        let log = self.log.clone();
        let name = self.name.clone();
        Job::from_fn(move || {
            log.record(format!("delete:{}", name));
            Ok(())
        })
    }
}

struct FakeImages {
    log: EventLog,
    fail_builds: bool,
}

impl FakeImages {
    fn handler(log: &EventLog) -> Arc<dyn Images> {
        Arc::new(Self {
            log: log.clone(),
            fail_builds: false,
        })
    }

    fn failing_builds(log: &EventLog) -> Arc<dyn Images> {
        Arc::new(Self {
            log: log.clone(),
            fail_builds: true,
        })
    }
}

impl Images for FakeImages {
    fn pull(&self, _ctx: &RunContext, image: &ThirdPartyImage) -> Job {
        let log = self.log.clone();
        let name = image.name.clone();
        Job::from_fn(move || {
            log.record(format!("pull:{}", name));
            Ok(())
        })
    }

    fn build(
        &self,
        _ctx: &RunContext,
        image: &CustomImage,
        tag: &str,
        _extra_tags: &[String],
    ) -> Job {
        let log = self.log.clone();
        let name = image.with_tag(tag);
        if self.fail_builds {
            return Job::from_fn(move || Err(kindling::Error::setup(format!("Building image {}", name), "boom")));
        }
        Job::from_fn(move || {
            log.record(format!("build:{}", name));
            Ok(())
        })
    }

    fn save(&self, _ctx: &RunContext, _images: &[String], _dest: &Path) -> (Job, ImageFormat) {
        (Job::noop(), ImageFormat::Docker)
    }

    fn remove(&self, _ctx: &RunContext, images: &[String]) -> Job {
        let log = self.log.clone();
        let images = images.to_vec();
        Job::from_fn(move || {
            for image in images {
                log.record(format!("remove:{}", image));
            }
            Ok(())
        })
    }
}

struct FakeHelm {
    log: EventLog,
}

impl FakeHelm {
    fn handler(log: &EventLog) -> Arc<dyn kindling::Helm> {
        Arc::new(Self { log: log.clone() })
    }
}

impl kindling::Helm for FakeHelm {
    fn add_repo(&self, _ctx: &RunContext, repo: &HelmRepo) -> Job {
        let log = self.log.clone();
        let name = repo.name.clone();
        Job::from_fn(move || {
            log.record(format!("repo-add:{}", name));
            Ok(())
        })
    }

    fn install_or_upgrade(
        &self,
        harness: &Kindling,
        ctx: &RunContext,
        cluster: Arc<dyn Cluster>,
        release: &HelmRelease,
    ) -> Job {
        let log = self.log.clone();
        let harness = harness.clone();
        let ctx = ctx.clone();
        let release = release.clone();
        Job::from_future(async move {
            // resolve deferred set values exactly as a real backend would
            for (key, value) in
                kindling::resolve_set_args(&harness, &ctx, &cluster, &release).await?
            {
                log.record(format!("set:{}={}", key, value));
            }
            log.record(format!("release:{}", release.name));
            Ok(())
        })
    }

    fn delete(
        &self,
        _ctx: &RunContext,
        _cluster: Arc<dyn Cluster>,
        release: &HelmRelease,
        _skip_not_exists: bool,
    ) -> Job {
        let log = self.log.clone();
        let name = release.name.clone();
        Job::from_fn(move || {
            log.record(format!("delete-release:{}", name));
            Ok(())
        })
    }
}

struct FakeManifests {
    log: EventLog,
}

impl FakeManifests {
    fn handler(log: &EventLog) -> Arc<dyn Manifests> {
        Arc::new(Self { log: log.clone() })
    }
}

impl Manifests for FakeManifests {
    fn create_or_update(
        &self,
        _harness: &Kindling,
        _ctx: &RunContext,
        _cluster: Arc<dyn Cluster>,
        set: &ManifestSet,
    ) -> Job {
        let log = self.log.clone();
        let name = set.name.clone();
        Job::from_fn(move || {
            log.record(format!("apply:{}", name));
            Ok(())
        })
    }

    fn delete(
        &self,
        _harness: &Kindling,
        _ctx: &RunContext,
        _cluster: Arc<dyn Cluster>,
        set: &ManifestSet,
    ) -> Job {
        let log = self.log.clone();
        let name = set.name.clone();
        Job::from_fn(move || {
            log.record(format!("delete-manifests:{}", name));
            Ok(())
        })
    }
}

fn opts(log: &EventLog) -> SuiteOpts {
    SuiteOpts {
        images: Some(FakeImages::handler(log)),
        helm: Some(FakeHelm::handler(log)),
        manifests: Some(FakeManifests::handler(log)),
        ..Default::default()
    }
}

fn local_release(name: &str) -> HelmRelease {
    HelmRelease {
        name: name.to_string(),
        chart: HelmChart::local("./charts/app"),
        ..Default::default()
    }
}

/// One cluster depending on one image: the pull and the cluster create both
/// precede the load, and the load precedes teardown.
#[tokio::test]
async fn linear_pull_create_load_ordering() {
    let log = EventLog::default();
    let g = Kindling::new(opts(&log));
    let image = g.third_party_image(ThirdPartyImage::new("img"));
    let _cluster = g.cluster(FakeCluster::named("c", &log), &[&image]);

    let ctx = RunContext::new();
    g.setup(&ctx).await.unwrap();

    log.assert_before("pull:img", "load:img@c");
    log.assert_before("create:c", "load:img@c");

    let errors = g.teardown(&ctx).await;
    assert!(errors.is_empty());
    assert_eq!(log.count("delete:c"), 1);
    // teardown is last on the timeline
    assert_eq!(log.position("delete:c"), log.events().len() - 1);
}

/// Two releases sharing an image on one cluster: the image is pulled and
/// loaded exactly once, and both releases wait for the load.
#[tokio::test]
async fn fan_out_shares_pull_and_load() {
    let log = EventLog::default();
    let g = Kindling::new(opts(&log));
    let image = g.third_party_image(ThirdPartyImage::new("img"));
    let cluster = g.cluster(FakeCluster::named("c", &log), &[&image]);
    g.release(&cluster, local_release("r1"), &[&image]);
    g.release(&cluster, local_release("r2"), &[&image]);

    let ctx = RunContext::new();
    g.setup(&ctx).await.unwrap();

    assert_eq!(log.count("pull:img"), 1);
    assert_eq!(log.count("load:img@c"), 1);
    log.assert_before("load:img@c", "release:r1");
    log.assert_before("load:img@c", "release:r2");
}

/// A failing build: the first error is returned, dependents never start,
/// and what did complete is torn down in reverse order.
#[tokio::test]
async fn failure_is_contained_and_cleaned_up() {
    let log = EventLog::default();
    let g = Kindling::new(SuiteOpts {
        images: Some(FakeImages::failing_builds(&log)),
        helm: Some(FakeHelm::handler(&log)),
        ..Default::default()
    });
    let broken = g.custom_image(CustomImage {
        repository: "broken".to_string(),
        ..Default::default()
    });
    let cluster = g.cluster(FakeCluster::named("c", &log), &[&broken]);
    g.release(&cluster, local_release("r"), &[&broken]);

    let ctx = RunContext::new();
    let err = g.setup(&ctx).await.unwrap_err();
    assert!(err.to_string().contains("boom"));
    assert!(g.failed());

    // nothing downstream of the broken build ran
    assert!(!log.contains("load:broken:kindling-latest@c"));
    assert!(!log.contains("release:r"));

    // the cluster node has no edge from the build, so it completed and is
    // deleted during teardown
    assert!(log.contains("create:c"));
    g.teardown(&ctx).await;
    assert!(log.contains("delete:c"));
}

/// A deferred set value is resolved with the owning cluster's handle at
/// install time, never at registration time.
#[tokio::test]
async fn deferred_value_receives_the_owning_cluster() {
    let log = EventLog::default();
    let g = Kindling::new(opts(&log));
    let cluster = g.cluster(FakeCluster::named("c", &log), &[]);

    let mut release = local_release("db");
    release.set.insert(
        "password".to_string(),
        Value::deferred_with_cluster(|_ctx, cluster| async move {
            Ok(format!("abc123-{}", cluster.name()))
        }),
    );
    g.release(&cluster, release, &[&NO_DEPENDENCIES]);

    let ctx = RunContext::new();
    g.setup(&ctx).await.unwrap();

    log.assert_before("set:password=abc123-c", "release:db");
}

/// A child spec reaches into parent-side resources through synthetic no-op
/// nodes; its own nodes run exactly once.
#[tokio::test]
async fn child_spec_inherits_parent_resources() {
    let log = EventLog::default();
    let g = Kindling::new(opts(&log));
    let image = g.third_party_image(ThirdPartyImage::new("img"));
    let cluster = g.cluster(FakeCluster::named("c", &log), &[&image]);

    let ctx = RunContext::new();
    g.setup(&ctx).await.unwrap();
    let suite_events = log.events().len();

    let child = g.for_spec();
    child.manifests(&cluster, ManifestSet::new("m"), &[&image]);
    child.setup(&ctx).await.unwrap();

    // the parent's pull/load/create did not re-run
    assert_eq!(log.count("pull:img"), 1);
    assert_eq!(log.count("load:img@c"), 1);
    assert_eq!(log.count("create:c"), 1);
    // the child applied its manifests exactly once
    assert_eq!(log.count("apply:m"), 1);
    assert_eq!(log.events().len(), suite_events + 1);

    // child teardown removes the manifests but leaves the parent cluster
    child.teardown(&ctx).await;
    assert!(log.contains("delete-manifests:m"));
    assert!(!log.contains("delete:c"));

    g.teardown(&ctx).await;
    assert!(log.contains("delete:c"));
}

/// Cleanup runs in reverse dependency order: the release comes off before
/// the manifests it depended on, and the cluster goes last.
#[tokio::test]
async fn teardown_reverses_the_dependency_order() {
    let log = EventLog::default();
    let g = Kindling::new(opts(&log));
    let cluster = g.cluster(FakeCluster::named("c", &log), &[]);
    let manifests = g.manifests(&cluster, ManifestSet::new("base"), &[]);
    g.release(&cluster, local_release("app"), &[&manifests]);

    let ctx = RunContext::new();
    g.setup(&ctx).await.unwrap();
    let errors = g.teardown(&ctx).await;
    assert!(errors.is_empty());

    log.assert_before("delete-release:app", "delete-manifests:base");
    log.assert_before("delete-manifests:base", "delete:c");
}

/// A cluster action's cleanup runs iff its setup completed.
#[tokio::test]
async fn action_cleanup_follows_setup_completion() {
    let log = EventLog::default();
    let g = Kindling::new(opts(&log));
    let cluster = g.cluster(FakeCluster::named("c", &log), &[]);

    let ok_log = log.clone();
    let ok_done = log.clone();
    g.cluster_action(
        &cluster,
        "healthy",
        ClusterActionHooks::new(move |_g, _ctx, _cluster| {
            let log = ok_log.clone();
            async move {
                log.record("action:healthy");
                Ok(())
            }
        })
        .with_cleanup(move |_g, _ctx, _cluster| {
            let log = ok_done.clone();
            async move {
                log.record("undo:healthy");
                Ok(())
            }
        }),
        &[],
    );

    let broken_done = log.clone();
    g.cluster_action(
        &cluster,
        "broken",
        ClusterActionHooks::new(|_g, _ctx, _cluster| async {
            Err(kindling::Error::setup("Executing action broken", "nope"))
        })
        .with_cleanup(move |_g, _ctx, _cluster| {
            let log = broken_done.clone();
            async move {
                log.record("undo:broken");
                Ok(())
            }
        }),
        &[],
    );

    let ctx = RunContext::new();
    let err = g.setup(&ctx).await.unwrap_err();
    assert!(err.to_string().contains("nope"));

    g.teardown(&ctx).await;
    assert!(log.contains("undo:healthy"));
    assert!(!log.contains("undo:broken"));
}

/// The suite-level cleanup toggle suppresses root cleanups, while
/// cleanup-only actions still fire.
#[tokio::test]
async fn no_suite_cleanup_leaves_the_environment() {
    let log = EventLog::default();
    let g = Kindling::new(SuiteOpts {
        no_suite_cleanup: true,
        ..opts(&log)
    });
    let cluster = g.cluster(FakeCluster::named("c", &log), &[]);
    g.manifests(&cluster, ManifestSet::new("m"), &[]);

    let always_log = log.clone();
    g.cluster_action(
        &cluster,
        "scrub",
        ClusterActionHooks::cleanup_only(move |_g, _ctx, _cluster| {
            let log = always_log.clone();
            async move {
                log.record("undo:scrub");
                Ok(())
            }
        }),
        &[],
    );

    let ctx = RunContext::new();
    g.setup(&ctx).await.unwrap();
    g.teardown(&ctx).await;

    assert!(!log.contains("delete:c"));
    assert!(!log.contains("delete-manifests:m"));
    assert!(log.contains("undo:scrub"));
}

/// The spec-level cleanup toggle suppresses child cleanups only.
#[tokio::test]
async fn no_spec_cleanup_applies_to_children_only() {
    let log = EventLog::default();
    let g = Kindling::new(SuiteOpts {
        no_spec_cleanup: true,
        ..opts(&log)
    });
    let cluster = g.cluster(FakeCluster::named("c", &log), &[]);

    let ctx = RunContext::new();
    g.setup(&ctx).await.unwrap();

    let child = g.for_spec();
    child.manifests(&cluster, ManifestSet::new("m"), &[]);
    child.setup(&ctx).await.unwrap();

    child.teardown(&ctx).await;
    assert!(!log.contains("delete-manifests:m"));

    // the root still cleans up
    g.teardown(&ctx).await;
    assert!(log.contains("delete:c"));
}

/// Failure-gated actions fire only when the suite was marked failed.
#[tokio::test]
async fn on_failure_actions_fire_only_after_failure() {
    for failed in [false, true] {
        let log = EventLog::default();
        let g = Kindling::new(opts(&log));
        let cluster = g.cluster(FakeCluster::named("c", &log), &[]);

        let dump_log = log.clone();
        g.cluster_action(
            &cluster,
            "dump-diagnostics",
            ClusterActionHooks::on_failure(move |_g, _ctx, _cluster| {
                let log = dump_log.clone();
                async move {
                    log.record("undo:dump");
                    Ok(())
                }
            }),
            &[],
        );

        let ctx = RunContext::new();
        g.setup(&ctx).await.unwrap();
        if failed {
            g.mark_failed();
        }
        g.teardown(&ctx).await;
        assert_eq!(log.contains("undo:dump"), failed);
    }
}

/// `no_deps` skips manifests, releases and actions but still brings up
/// clusters and images.
#[tokio::test]
async fn no_deps_still_builds_the_environment() {
    let log = EventLog::default();
    let g = Kindling::new(SuiteOpts {
        no_deps: true,
        ..opts(&log)
    });
    let image = g.third_party_image(ThirdPartyImage::new("img"));
    let cluster = g.cluster(FakeCluster::named("c", &log), &[&image]);
    g.manifests(&cluster, ManifestSet::new("m"), &[]);
    g.release(&cluster, local_release("r"), &[]);

    let ctx = RunContext::new();
    g.setup(&ctx).await.unwrap();

    assert!(log.contains("pull:img"));
    assert!(log.contains("load:img@c"));
    assert!(log.contains("create:c"));
    assert!(!log.contains("apply:m"));
    assert!(!log.contains("release:r"));
}

/// A cleanup failure is reported but the remaining cleanups still run.
#[tokio::test]
async fn cleanup_errors_do_not_short_circuit() {
    let log = EventLog::default();
    let g = Kindling::new(opts(&log));
    let cluster = g.cluster(FakeCluster::named("c", &log), &[]);

    g.cluster_action(
        &cluster,
        "fragile",
        ClusterActionHooks::new(|_g, _ctx, _cluster| async { Ok(()) }).with_cleanup(
            |_g, _ctx, _cluster| async {
                Err(kindling::Error::setup("Undoing action fragile", "cannot undo"))
            },
        ),
        &[],
    );

    let ctx = RunContext::new();
    g.setup(&ctx).await.unwrap();
    let errors = g.teardown(&ctx).await;

    assert_eq!(errors.len(), 1);
    assert!(errors[0].to_string().contains("cannot undo"));
    // the cluster delete still happened, after the failing action's turn
    assert!(log.contains("delete:c"));
}

/// A daemon action's process is killed and reaped at teardown.
#[tokio::test]
async fn daemon_actions_are_killed_on_teardown() {
    let log = EventLog::default();
    let g = Kindling::new(opts(&log));
    let cluster = g.cluster(FakeCluster::named("c", &log), &[]);

    let daemon = Daemon::new(|_g: &Kindling, _cluster: &Arc<dyn Cluster>| {
        let mut cmd = tokio::process::Command::new("sleep");
        cmd.arg("600");
        cmd
    });
    g.cluster_action(&cluster, "port-forward", daemon.into_hooks(), &[]);

    let ctx = RunContext::new();
    g.setup(&ctx).await.unwrap();

    let started = std::time::Instant::now();
    let errors = g.teardown(&ctx).await;
    assert!(errors.is_empty());
    // the sleep was killed rather than awaited
    assert!(started.elapsed() < Duration::from_secs(30));
}

/// Remote chart repositories are added once, before any node runs.
#[tokio::test]
async fn chart_repos_are_added_before_setup() {
    let log = EventLog::default();
    let g = Kindling::new(opts(&log));
    let cluster = g.cluster(FakeCluster::named("c", &log), &[]);

    let repo = HelmRepo::new("bitnami", "https://charts.example/bitnami");
    g.release(
        &cluster,
        HelmRelease {
            name: "db".to_string(),
            chart: HelmChart::remote(repo.clone(), "mariadb", None),
            ..Default::default()
        },
        &[],
    );
    g.release(
        &cluster,
        HelmRelease {
            name: "cache".to_string(),
            chart: HelmChart::remote(repo, "redis", None),
            ..Default::default()
        },
        &[],
    );

    let ctx = RunContext::new();
    g.setup(&ctx).await.unwrap();

    assert_eq!(log.count("repo-add:bitnami"), 1);
    log.assert_before("repo-add:bitnami", "create:c");
    log.assert_before("repo-add:bitnami", "release:db");
}

/// An externally cancelled run unwinds without reporting an error, and what
/// completed is still torn down.
#[tokio::test]
async fn external_cancellation_is_not_an_error() {
    let log = EventLog::default();
    let g = Kindling::new(opts(&log));
    let cluster = g.cluster(FakeCluster::named("c", &log), &[]);

    let gate = Arc::new(tokio::sync::Notify::new());
    let started = gate.clone();
    g.cluster_action(
        &cluster,
        "blocked",
        ClusterActionHooks::new(move |_g, ctx: RunContext, _cluster| {
            let started = started.clone();
            async move {
                started.notify_one();
                ctx.cancelled().await;
                Err(kindling::Error::Cancelled)
            }
        }),
        &[],
    );

    let ctx = RunContext::new();
    let setup = {
        let g = g.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { g.setup(&ctx).await })
    };
    gate.notified().await;
    ctx.cancel();

    // a run that only unwound reports success
    setup.await.unwrap().unwrap();
    assert!(!g.failed());

    g.teardown(&RunContext::new()).await;
    // the cluster completed before cancellation and is torn down
    assert!(log.contains("delete:c"));
}

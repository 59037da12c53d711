//! User-provided cluster actions
//!
//! A cluster action is a pair of callables run against a registered cluster:
//! setup during materialization, cleanup during teardown. Flavors cover the
//! common shapes: plain setup, setup+cleanup, cleanup-only, cleanup that
//! fires only when the suite failed, and a daemon that spawns a long-lived
//! child process killed at teardown.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::cluster::Cluster;
use crate::job::RunContext;
use crate::suite::Kindling;
use crate::{Error, Result};

/// A callable run against a cluster: `(orchestrator, ctx, cluster)`
pub type ClusterActionFn = Arc<
    dyn Fn(Kindling, RunContext, Arc<dyn Cluster>) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

/// When a cluster action's cleanup fires
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum CleanupPolicy {
    /// Cleanup runs iff setup ran to completion, honoring the spec-state's
    /// cleanup toggle
    #[default]
    WithSetup,
    /// Cleanup runs unconditionally once its node is reached in teardown
    Always,
    /// Cleanup runs only when the suite has been marked failed
    OnSuiteFailure,
}

/// The setup/cleanup pair registered for a cluster action
#[derive(Clone, Default)]
pub struct ClusterActionHooks {
    pub(crate) setup: Option<ClusterActionFn>,
    pub(crate) cleanup: Option<ClusterActionFn>,
    pub(crate) cleanup_policy: CleanupPolicy,
}

/// Box a callable into the canonical stored shape
pub fn cluster_action_fn<F, Fut>(f: F) -> ClusterActionFn
where
    F: Fn(Kindling, RunContext, Arc<dyn Cluster>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |g, ctx, cluster| Box::pin(f(g, ctx, cluster)))
}

impl ClusterActionHooks {
    /// An action with setup only
    pub fn new<F, Fut>(setup: F) -> Self
    where
        F: Fn(Kindling, RunContext, Arc<dyn Cluster>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            setup: Some(cluster_action_fn(setup)),
            ..Default::default()
        }
    }

    /// Attach a cleanup to run at teardown (iff setup completed)
    pub fn with_cleanup<F, Fut>(mut self, cleanup: F) -> Self
    where
        F: Fn(Kindling, RunContext, Arc<dyn Cluster>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.cleanup = Some(cluster_action_fn(cleanup));
        self
    }

    /// An action with a no-op setup whose cleanup always runs, even when the
    /// suite's cleanup toggles are set
    pub fn cleanup_only<F, Fut>(cleanup: F) -> Self
    where
        F: Fn(Kindling, RunContext, Arc<dyn Cluster>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            setup: None,
            cleanup: Some(cluster_action_fn(cleanup)),
            cleanup_policy: CleanupPolicy::Always,
        }
    }

    /// An action with a no-op setup whose cleanup runs only when the suite
    /// has failed — e.g. dumping diagnostics from a broken environment
    pub fn on_failure<F, Fut>(cleanup: F) -> Self
    where
        F: Fn(Kindling, RunContext, Arc<dyn Cluster>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            setup: None,
            cleanup: Some(cluster_action_fn(cleanup)),
            cleanup_policy: CleanupPolicy::OnSuiteFailure,
        }
    }
}

impl std::fmt::Debug for ClusterActionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterActionHooks")
            .field("setup", &self.setup.as_ref().map(|_| "<fn>"))
            .field("cleanup", &self.cleanup.as_ref().map(|_| "<fn>"))
            .field("cleanup_policy", &self.cleanup_policy)
            .finish()
    }
}

/// A long-lived child process tied to a cluster's lifetime.
///
/// Setup spawns the process and arranges for it to be killed when the run
/// context is cancelled; cleanup kills it and waits. A process that already
/// exited is treated as cleaned up.
pub struct Daemon<F> {
    command: F,
    child: Arc<Mutex<Option<Child>>>,
}

impl<F> Daemon<F>
where
    F: Fn(&Kindling, &Arc<dyn Cluster>) -> Command + Send + Sync + 'static,
{
    /// A daemon whose command is built from the orchestrator and cluster at
    /// setup time
    pub fn new(command: F) -> Self {
        Self {
            command,
            child: Arc::new(Mutex::new(None)),
        }
    }

    /// Convert into registrable hooks
    pub fn into_hooks(self) -> ClusterActionHooks {
        let command = Arc::new(self.command);
        let child_slot = self.child;
        let cleanup_slot = child_slot.clone();

        let setup = move |g: Kindling, ctx: RunContext, cluster: Arc<dyn Cluster>| {
            let command = command.clone();
            let child_slot = child_slot.clone();
            async move {
                let mut cmd = (*command)(&g, &cluster);
                cmd.kill_on_drop(true);
                let line = crate::job::describe_command(&cmd);
                let child = cmd
                    .spawn()
                    .map_err(|e| Error::command(&line, format!("failed to spawn: {}", e)))?;
                debug!(command = %line, "daemon started");
                *child_slot
                    .lock()
                    .expect("daemon child slot lock poisoned") = Some(child);

                // a cancelled setup context must take the daemon down with it
                let watch_slot = child_slot.clone();
                tokio::spawn(async move {
                    ctx.cancelled().await;
                    kill_and_reap(&watch_slot).await;
                });
                Ok(())
            }
        };

        let cleanup = move |_g: Kindling, _ctx: RunContext, _cluster: Arc<dyn Cluster>| {
            let slot = cleanup_slot.clone();
            async move {
                kill_and_reap(&slot).await;
                Ok(())
            }
        };

        ClusterActionHooks::new(setup).with_cleanup(cleanup)
    }
}

/// Kill the daemon's child if it is still around and reap it. An
/// already-exited child is success.
async fn kill_and_reap(slot: &Arc<Mutex<Option<Child>>>) {
    let child = slot
        .lock()
        .expect("daemon child slot lock poisoned")
        .take();
    if let Some(mut child) = child {
        // start_kill errors when the process already exited
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "daemon already exited");
        }
        match child.wait().await {
            Ok(status) => debug!(%status, "daemon reaped"),
            Err(e) => warn!(error = %e, "failed to reap daemon"),
        }
    }
}

//! Deferred executables and the shared run context
//!
//! A [`Job`] is a unit of external work (usually a subprocess) that has been
//! fully described but not yet started. Backends hand jobs to the engine,
//! which decides when to run them. Jobs compose sequentially ([`Job::and`]),
//! in parallel ([`Job::fan_out`]) and conditionally ([`Job::or`]); every
//! composition propagates cancellation.
//!
//! All command executions capture stderr for error context and are killed
//! when the owning [`RunContext`] is cancelled.

use std::process::Stdio;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Cancellation scope shared by every node of a single setup or cleanup run.
///
/// Cloning is cheap; all clones observe the same token. Cleanup always runs
/// under a fresh context so a cancelled setup still tears down what it built.
#[derive(Clone, Debug, Default)]
pub struct RunContext {
    cancel: CancellationToken,
}

impl RunContext {
    /// Create a new, uncancelled context
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel this context and everything derived from it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check whether this context has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until this context is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Derive a child context that is cancelled when this one is
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
        }
    }
}

/// A deferred executable yielding success or error
pub struct Job {
    fut: BoxFuture<'static, Result<()>>,
}

impl Job {
    /// Wrap a future as a job
    pub fn from_future<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self { fut: fut.boxed() }
    }

    /// A job that does nothing and succeeds
    pub fn noop() -> Self {
        Self::from_future(async { Ok(()) })
    }

    /// A job that immediately yields the given error
    pub fn fail(err: Error) -> Self {
        Self::from_future(async move { Err(err) })
    }

    /// Wrap a synchronous closure as a job
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self::from_future(async move { f() })
    }

    /// Run an external command as a job, discarding its stdout
    pub fn command(ctx: &RunContext, cmd: Command) -> Self {
        let ctx = ctx.clone();
        Self::from_future(async move {
            run_command(&ctx, cmd, None).await?;
            Ok(())
        })
    }

    /// Execute the job to completion
    pub async fn run(self) -> Result<()> {
        self.fut.await
    }

    /// Run jobs one after another, stopping at the first error
    pub fn and(jobs: impl IntoIterator<Item = Job>) -> Self {
        let jobs: Vec<Job> = jobs.into_iter().collect();
        Self::from_future(async move {
            for job in jobs {
                job.run().await?;
            }
            Ok(())
        })
    }

    /// Run jobs concurrently, failing with the first error observed.
    ///
    /// Siblings of a failed job are dropped, which kills any child process
    /// they had spawned.
    pub fn fan_out(jobs: impl IntoIterator<Item = Job>) -> Self {
        let jobs: Vec<Job> = jobs.into_iter().collect();
        Self::from_future(async move {
            futures::future::try_join_all(jobs.into_iter().map(|j| j.fut)).await?;
            Ok(())
        })
    }

    /// Run the fallback only if this job fails.
    ///
    /// Cancellation is not absorbed: if this job unwinds due to
    /// cancellation, the fallback is not attempted.
    pub fn or(self, fallback: Job) -> Self {
        Self::from_future(async move {
            match self.run().await {
                Ok(()) => Ok(()),
                Err(e) if e.is_cancelled() => Err(e),
                Err(e) => {
                    debug!(error = %e, "first job failed, running fallback");
                    fallback.run().await
                }
            }
        })
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Job")
    }
}

/// Render a command line for logs and errors
pub(crate) fn describe_command(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    let mut parts = vec![std_cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(
        std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned()),
    );
    parts.join(" ")
}

/// Spawn a command, optionally feeding stdin, and wait for it under the run
/// context. Returns captured stdout.
///
/// The child is killed if the context is cancelled or the returned future is
/// dropped mid-flight.
pub(crate) async fn run_command(
    ctx: &RunContext,
    mut cmd: Command,
    stdin: Option<String>,
) -> Result<String> {
    let line = describe_command(&cmd);
    debug!(command = %line, "running command");

    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::command(&line, format!("failed to spawn: {}", e)))?;

    if let Some(input) = stdin {
        let mut handle = child
            .stdin
            .take()
            .ok_or_else(|| Error::command(&line, "stdin not captured"))?;
        handle
            .write_all(input.as_bytes())
            .await
            .map_err(|e| Error::command(&line, format!("failed to write stdin: {}", e)))?;
        drop(handle);
    }

    let output = tokio::select! {
        out = child.wait_with_output() => {
            out.map_err(|e| Error::command(&line, format!("failed to wait: {}", e)))?
        }
        _ = ctx.cancelled() => {
            warn!(command = %line, "command cancelled");
            return Err(Error::Cancelled);
        }
    };

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(Error::command(
            &line,
            format!("{}: {}", output.status, stderr),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counting_job(counter: Arc<AtomicUsize>) -> Job {
        Job::from_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_and_runs_in_order_and_stops_on_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        let job = Job::and(vec![
            counting_job(counter.clone()),
            Job::fail(Error::value("boom")),
            counting_job(counter.clone()),
        ]);
        assert!(job.run().await.is_err());
        // the job after the failure never ran
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fan_out_runs_all() {
        let counter = Arc::new(AtomicUsize::new(0));
        let job = Job::fan_out((0..5).map(|_| counting_job(counter.clone())).collect::<Vec<_>>());
        job.run().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_or_falls_back_only_on_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        Job::noop()
            .or(counting_job(counter.clone()))
            .run()
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        Job::fail(Error::value("nope"))
            .or(counting_job(counter.clone()))
            .run()
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    /// Story: cancellation does not trigger fallbacks
    ///
    /// `or` is used for "exists || create" constructions; a cancelled
    /// existence probe must not start a create.
    #[tokio::test]
    async fn story_or_does_not_absorb_cancellation() {
        let counter = Arc::new(AtomicUsize::new(0));
        let result = Job::fail(Error::Cancelled)
            .or(counting_job(counter.clone()))
            .run()
            .await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_command_captures_stdout() {
        let ctx = RunContext::new();
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let out = run_command(&ctx, cmd, None).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_command_feeds_stdin() {
        let ctx = RunContext::new();
        let out = run_command(&ctx, Command::new("cat"), Some("piped".to_string()))
            .await
            .unwrap();
        assert_eq!(out, "piped");
    }

    #[tokio::test]
    async fn test_run_command_reports_failure_with_command_line() {
        let ctx = RunContext::new();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo oops >&2; exit 3"]);
        let err = run_command(&ctx, cmd, None).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("sh -c"));
        assert!(msg.contains("oops"));
    }

    #[tokio::test]
    async fn test_run_command_observes_cancellation() {
        let ctx = RunContext::new();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = run_command(&ctx, cmd, None).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_context_follows_parent() {
        let parent = RunContext::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }
}

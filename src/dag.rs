//! DAG construction and the concurrent executor
//!
//! Build validates the registered nodes (unique ids, no dangling
//! dependencies, no cycles) before anything runs. Setup launches each node
//! on its own task as soon as its dependencies complete, fails fast by
//! cancelling the shared context while letting in-flight nodes finish, and
//! records every completed node in the owning state's cleanup log. Teardown
//! runs the reverse of the DAG restricted to that completed subset: a node
//! cleans up only after everything that depended on it has cleaned up.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::job::RunContext;
use crate::node::SpecNode;
use crate::suite::Kindling;
use crate::{Error, Result};

/// A validated dependency graph over spec nodes
#[derive(Debug)]
pub(crate) struct Dag {
    nodes: Vec<SpecNode>,
    /// dependents[i] lists the node indices waiting on node i
    dependents: Vec<Vec<usize>>,
    /// indegree[i] counts the unfinished dependencies of node i
    indegree: Vec<usize>,
}

impl Dag {
    /// Validate a flat node list and build the forward graph
    pub(crate) fn build(nodes: Vec<SpecNode>) -> Result<Self> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        for (ix, node) in nodes.iter().enumerate() {
            if index.insert(&node.id, ix).is_some() {
                return Err(Error::construction_for(
                    node.id.clone(),
                    "duplicate node id",
                ));
            }
        }

        let mut dependents = vec![Vec::new(); nodes.len()];
        let mut indegree = vec![0usize; nodes.len()];
        for (ix, node) in nodes.iter().enumerate() {
            let deps: BTreeSet<&String> = node.depends_on.iter().collect();
            for dep in deps {
                let dep_ix = *index.get(dep.as_str()).ok_or_else(|| {
                    Error::construction_for(
                        node.id.clone(),
                        format!("depends on unknown id {}", dep),
                    )
                })?;
                dependents[dep_ix].push(ix);
                indegree[ix] += 1;
            }
        }

        // topological sweep; whatever it cannot reach sits on a cycle
        let mut remaining = indegree.clone();
        let mut queue: VecDeque<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg == 0)
            .map(|(ix, _)| ix)
            .collect();
        let mut visited = 0usize;
        while let Some(ix) = queue.pop_front() {
            visited += 1;
            for &dep in &dependents[ix] {
                remaining[dep] -= 1;
                if remaining[dep] == 0 {
                    queue.push_back(dep);
                }
            }
        }
        if visited < nodes.len() {
            let cycle: Vec<&str> = remaining
                .iter()
                .enumerate()
                .filter(|(_, deg)| **deg > 0)
                .map(|(ix, _)| nodes[ix].id.as_str())
                .collect();
            return Err(Error::construction_for(
                cycle[0].to_string(),
                format!("dependency cycle involving nodes [{}]", cycle.join(", ")),
            ));
        }

        Ok(Self {
            nodes,
            dependents,
            indegree,
        })
    }

    /// Build the reversed graph over a completed subset.
    ///
    /// Edge direction flips: if A depended on B during setup, B now waits for
    /// A, so dependents clean up before the things they depended on.
    pub(crate) fn reversed_over(nodes: Vec<SpecNode>) -> Self {
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(ix, node)| (node.id.as_str(), ix))
            .collect();
        let mut dependents = vec![Vec::new(); nodes.len()];
        let mut indegree = vec![0usize; nodes.len()];
        for (ix, node) in nodes.iter().enumerate() {
            let deps: BTreeSet<&String> = node.depends_on.iter().collect();
            for dep in deps {
                // edges into nodes that never completed are dropped
                if let Some(&dep_ix) = index.get(dep.as_str()) {
                    dependents[ix].push(dep_ix);
                    indegree[dep_ix] += 1;
                }
            }
        }
        Self {
            nodes,
            dependents,
            indegree,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// Runs a DAG's nodes with bounded (or unbounded) concurrency
pub(crate) struct Executor {
    pub(crate) max_concurrency: Option<usize>,
}

enum Mode {
    Setup,
    Cleanup,
}

impl Executor {
    /// Run setup over the forward graph.
    ///
    /// Returns the first non-cancellation error; completed nodes land in the
    /// owning state's cleanup log in completion order.
    pub(crate) async fn run_setup(
        &self,
        dag: Dag,
        g: &Kindling,
        ctx: &RunContext,
    ) -> Result<()> {
        let (first_error, _) = self.drive(dag, g, ctx, Mode::Setup).await;
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run cleanup over a reversed graph. Errors are collected, never fatal.
    pub(crate) async fn run_cleanup(
        &self,
        dag: Dag,
        g: &Kindling,
        ctx: &RunContext,
    ) -> Vec<Error> {
        let (_, errors) = self.drive(dag, g, ctx, Mode::Cleanup).await;
        errors
    }

    async fn drive(
        &self,
        dag: Dag,
        g: &Kindling,
        ctx: &RunContext,
        mode: Mode,
    ) -> (Option<Error>, Vec<Error>) {
        let semaphore = self.max_concurrency.map(|n| Arc::new(Semaphore::new(n)));
        let is_setup = matches!(mode, Mode::Setup);

        let dag = Arc::new(dag);
        let mut indegree = dag.indegree.clone();
        let mut ready: Vec<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg == 0)
            .map(|(ix, _)| ix)
            .collect();

        let mut tasks: JoinSet<(usize, Result<()>)> = JoinSet::new();
        let mut first_error: Option<Error> = None;
        let mut cleanup_errors = Vec::new();

        loop {
            // fail-fast: once setup has an error, launch nothing new and let
            // the in-flight tasks observe the cancelled context
            let launching = !is_setup || (first_error.is_none() && !ctx.is_cancelled());
            if launching {
                for ix in ready.drain(..) {
                    let node = dag.nodes[ix].clone();
                    let g = g.clone();
                    let ctx = ctx.clone();
                    let semaphore = semaphore.clone();
                    let is_setup_task = is_setup;
                    tasks.spawn(async move {
                        let _permit = match semaphore {
                            Some(sem) => {
                                tokio::select! {
                                    permit = sem.acquire_owned() => match permit {
                                        Ok(permit) => Some(permit),
                                        Err(_) => return (ix, Err(Error::Cancelled)),
                                    },
                                    _ = ctx.cancelled() => return (ix, Err(Error::Cancelled)),
                                }
                            }
                            None => None,
                        };
                        let title = if node.is_noop() { None } else { node.title(&g) };
                        if let Some(title) = &title {
                            if is_setup_task {
                                info!(node = %title, id = %node.id, "starting");
                            } else {
                                info!(node = %title, id = %node.id, "undoing");
                            }
                        }
                        let result = if is_setup_task {
                            node.setup(&g, &ctx).await
                        } else {
                            node.cleanup(&g, &ctx).await
                        };
                        if let Some(title) = &title {
                            match &result {
                                Ok(()) => info!(node = %title, "finished"),
                                Err(e) if e.is_cancelled() => {
                                    debug!(node = %title, "unwound by cancellation")
                                }
                                Err(e) => warn!(node = %title, error = %e, "failed"),
                            }
                        }
                        (ix, result)
                    });
                }
            } else {
                ready.clear();
            }

            let joined = match tasks.join_next().await {
                Some(joined) => joined,
                None => break,
            };

            let (ix, result) = match joined {
                Ok(done) => done,
                Err(join_err) => {
                    // a panicked node is a failed node; the index is lost, so
                    // the error is recorded without scheduling anything new
                    let err = Error::setup("node task", join_err.to_string());
                    if is_setup {
                        if first_error.is_none() {
                            ctx.cancel();
                            first_error = Some(err);
                        } else {
                            warn!(error = %err, "additional node panic after first error");
                        }
                    } else {
                        cleanup_errors.push(err);
                    }
                    continue;
                }
            };

            match result {
                Ok(()) => {
                    if is_setup {
                        g.spec_state()
                            .cleanup
                            .lock()
                            .expect("cleanup log lock poisoned")
                            .push(dag.nodes[ix].clone());
                    }
                    for &dependent in &dag.dependents[ix] {
                        indegree[dependent] -= 1;
                        if indegree[dependent] == 0 {
                            ready.push(dependent);
                        }
                    }
                }
                Err(err) if err.is_cancelled() => {
                    // unwound, not failed: neither logged for cleanup nor
                    // reported; dependents never start
                }
                Err(err) => {
                    if is_setup {
                        if first_error.is_none() {
                            ctx.cancel();
                            first_error = Some(err);
                        } else {
                            warn!(error = %err, "additional node error after first");
                        }
                    } else {
                        cleanup_errors.push(err);
                        // cleanup keeps going; nodes waiting on this one
                        // still get their turn
                        for &dependent in &dag.dependents[ix] {
                            indegree[dependent] -= 1;
                            if indegree[dependent] == 0 {
                                ready.push(dependent);
                            }
                        }
                    }
                }
            }
        }

        (first_error, cleanup_errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Action;

    fn noop(id: &str, deps: &[&str]) -> SpecNode {
        SpecNode {
            id: id.to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            action: Action::Noop,
        }
    }

    #[test]
    fn test_build_accepts_a_valid_graph() {
        let dag = Dag::build(vec![
            noop("a", &[]),
            noop("b", &["a"]),
            noop("c", &["a", "b"]),
        ])
        .unwrap();
        assert_eq!(dag.len(), 3);
    }

    #[test]
    fn test_build_rejects_duplicate_ids() {
        let err = Dag::build(vec![noop("a", &[]), noop("a", &[])]).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
        assert_eq!(err.node(), Some("a"));
    }

    #[test]
    fn test_build_rejects_dangling_dependencies() {
        let err = Dag::build(vec![noop("a", &["ghost"])]).unwrap_err();
        assert!(err.to_string().contains("unknown id ghost"));
        assert_eq!(err.node(), Some("a"));
    }

    /// Story: cycles are reported with their members
    #[test]
    fn story_cycles_fail_construction_naming_a_member() {
        let err = Dag::build(vec![
            noop("a", &["c"]),
            noop("b", &["a"]),
            noop("c", &["b"]),
            noop("free", &[]),
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cycle"));
        // at least one member is named, and the unrelated node is not
        assert!(msg.contains('a') || msg.contains('b') || msg.contains('c'));
        assert!(!msg.contains("free"));
        assert!(err.node().is_some());
    }

    #[test]
    fn test_duplicate_dependency_entries_count_once() {
        // a dependency listed twice must not double-decrement
        let dag = Dag::build(vec![noop("a", &[]), noop("b", &["a", "a"])]).unwrap();
        assert_eq!(dag.indegree[1], 1);
    }

    #[test]
    fn test_reversed_graph_flips_edges() {
        let dag = Dag::reversed_over(vec![noop("a", &[]), noop("b", &["a"])]);
        // b depended on a, so in the reversed graph a waits for b
        assert_eq!(dag.indegree[0], 1);
        assert_eq!(dag.indegree[1], 0);
        assert_eq!(dag.dependents[1], vec![0]);
    }

    #[test]
    fn test_reversed_graph_drops_edges_to_missing_nodes() {
        // "a" never completed setup, so it is absent from the subset
        let dag = Dag::reversed_over(vec![noop("b", &["a"])]);
        assert_eq!(dag.indegree[0], 0);
    }
}

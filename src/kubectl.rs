//! The kubectl command seam and the `kubectl`-CLI manifest backend
//!
//! [`KubectlCli`] plays two roles: it implements the [`Kubectl`] contract
//! (building connection-scoped commands for anything that wants to shell out
//! to kubectl) and the [`Manifests`] contract (server-side apply / create /
//! replace of manifest sets, waits, deletion). Applied objects are parsed
//! back from `--output yaml` and recorded into the set's output sink when
//! one was provided.

use std::sync::Arc;

use serde::Deserialize;
use tokio::process::Command;
use tracing::warn;

use crate::cluster::{connection_args, Cluster};
use crate::job::{run_command, Job, RunContext};
use crate::manifests::{ManifestSet, Manifests, WaitFor};
use crate::suite::Kindling;
use crate::value::{resolve_nested_object, ValueContext};
use crate::{Error, Result};

/// Knows how to execute kubectl commands against a cluster
pub trait Kubectl: Send + Sync {
    /// Build a kubectl command scoped to the cluster's connection
    fn command(&self, cluster: &dyn Cluster, args: &[String]) -> Command;
}

/// Drives the `kubectl` binary
#[derive(Clone, Debug, Default)]
pub struct KubectlCli {
    /// The command to execute; `kubectl` on `$PATH` when empty
    pub command: Vec<String>,
}

impl Kubectl for KubectlCli {
    fn command(&self, cluster: &dyn Cluster, args: &[String]) -> Command {
        let mut argv: Vec<String> = if self.command.is_empty() {
            vec!["kubectl".to_string()]
        } else {
            self.command.clone()
        };
        argv.extend(connection_args(&cluster.connection()));
        argv.extend(args.iter().cloned());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd
    }
}

/// Arguments for one `kubectl wait` invocation
pub(crate) fn wait_args(wait: &WaitFor) -> Vec<String> {
    let mut args = vec!["wait".to_string(), wait.resource.clone()];
    for (key, value) in &wait.conditions {
        args.push("--for".to_string());
        if value.is_empty() {
            args.push(key.clone());
        } else {
            args.push(format!("{}={}", key, value));
        }
    }
    args.extend(wait.flags.iter().cloned());
    args
}

impl Kindling {
    /// Issue a parallel burst of `kubectl wait` commands against a cluster
    pub fn kubectl_wait(
        &self,
        ctx: &RunContext,
        cluster: Arc<dyn Cluster>,
        waits: &[WaitFor],
    ) -> Job {
        let kubectl = self.options().kubectl_backend();
        Job::fan_out(
            waits
                .iter()
                .map(|wait| {
                    Job::command(ctx, kubectl.command(cluster.as_ref(), &wait_args(wait)))
                })
                .collect::<Vec<_>>(),
        )
    }
}

impl KubectlCli {
    fn file_args(set: &ManifestSet, deleting: bool, path: &str, recursive: bool) -> Vec<String> {
        let mut args = if deleting {
            vec!["delete".to_string()]
        } else if set.create {
            vec![
                "create".to_string(),
                "--output".to_string(),
                "yaml".to_string(),
            ]
        } else {
            vec![
                "apply".to_string(),
                "--server-side".to_string(),
                "--output".to_string(),
                "yaml".to_string(),
            ]
        };
        args.push("--filename".to_string());
        args.push(path.to_string());
        if !deleting && set.replace {
            args.push("--replace".to_string());
        }
        if recursive {
            args.push("--recursive".to_string());
        }
        if let Some(namespace) = &set.namespace {
            args.push("--namespace".to_string());
            args.push(namespace.clone());
        }
        if deleting && set.skip_delete_wait {
            args.push("--wait=false".to_string());
        }
        args
    }

    /// Render a set's in-memory objects as one multi-document YAML string,
    /// resolving deferred values against the owning cluster.
    async fn objects_yaml(
        harness: &Kindling,
        ctx: &RunContext,
        cluster: &Arc<dyn Cluster>,
        set: &ManifestSet,
    ) -> Result<String> {
        let cx = ValueContext {
            harness: harness.clone(),
            ctx: ctx.clone(),
            cluster: cluster.clone(),
        };
        let mut docs = Vec::with_capacity(set.resource_objects.len());
        for object in &set.resource_objects {
            let resolved = resolve_nested_object(object, &cx).await?;
            docs.push(
                serde_yaml::to_string(&resolved)
                    .map_err(|e| Error::serialization(e.to_string()))?,
            );
        }
        Ok(docs.join("---\n"))
    }

    /// Run one apply-style command, recording reported objects in the sink
    async fn run_recorded(
        ctx: &RunContext,
        cmd: Command,
        stdin: Option<String>,
        set: &ManifestSet,
    ) -> Result<()> {
        let output = run_command(ctx, cmd, stdin).await?;
        if let Some(sink) = &set.applied {
            match parse_reported_objects(&output) {
                Ok(mut objects) => sink
                    .lock()
                    .expect("applied-objects sink lock poisoned")
                    .append(&mut objects),
                // recording is best-effort; the apply itself succeeded
                Err(e) => warn!(set = %set.name, error = %e, "could not parse applied objects"),
            }
        }
        Ok(())
    }
}

/// Parse the YAML kubectl printed back. A `List` is flattened into its items.
fn parse_reported_objects(output: &str) -> Result<Vec<serde_json::Value>> {
    let mut objects = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(output) {
        let value = serde_json::Value::deserialize(doc)
            .map_err(|e| Error::serialization(e.to_string()))?;
        if value.is_null() {
            continue;
        }
        if value.get("kind").and_then(|k| k.as_str()) == Some("List") {
            if let Some(items) = value.get("items").and_then(|i| i.as_array()) {
                objects.extend(items.iter().cloned());
            }
        } else {
            objects.push(value);
        }
    }
    Ok(objects)
}

impl Manifests for KubectlCli {
    fn create_or_update(
        &self,
        harness: &Kindling,
        ctx: &RunContext,
        cluster: Arc<dyn Cluster>,
        set: &ManifestSet,
    ) -> Job {
        let this = self.clone();
        let harness = harness.clone();
        let ctx = ctx.clone();
        let set = set.clone();
        Job::from_future(async move {
            let mut applies = Vec::new();

            if !set.resource_objects.is_empty() {
                let yaml = Self::objects_yaml(&harness, &ctx, &cluster, &set).await?;
                let args = Self::file_args(&set, false, "-", false);
                let cmd = this.command(cluster.as_ref(), &args);
                let ctx = ctx.clone();
                let set = set.clone();
                applies.push(Job::from_future(async move {
                    Self::run_recorded(&ctx, cmd, Some(yaml), &set).await
                }));
            }
            for resource in &set.resources {
                let args = Self::file_args(&set, false, "-", false);
                let cmd = this.command(cluster.as_ref(), &args);
                let ctx = ctx.clone();
                let set = set.clone();
                let resource = resource.clone();
                applies.push(Job::from_future(async move {
                    Self::run_recorded(&ctx, cmd, Some(resource), &set).await
                }));
            }
            for path in &set.resource_paths {
                let args = Self::file_args(&set, false, &path.display().to_string(), false);
                let cmd = this.command(cluster.as_ref(), &args);
                let ctx = ctx.clone();
                let set = set.clone();
                applies.push(Job::from_future(async move {
                    Self::run_recorded(&ctx, cmd, None, &set).await
                }));
            }
            for dir in &set.resource_recursive_dirs {
                let args = Self::file_args(&set, false, &dir.display().to_string(), true);
                let cmd = this.command(cluster.as_ref(), &args);
                let ctx = ctx.clone();
                let set = set.clone();
                applies.push(Job::from_future(async move {
                    Self::run_recorded(&ctx, cmd, None, &set).await
                }));
            }

            Job::fan_out(applies).run().await?;

            let waits = set
                .wait
                .iter()
                .map(|wait| Job::command(&ctx, this.command(cluster.as_ref(), &wait_args(wait))))
                .collect::<Vec<_>>();
            Job::fan_out(waits).run().await
        })
    }

    fn delete(
        &self,
        harness: &Kindling,
        ctx: &RunContext,
        cluster: Arc<dyn Cluster>,
        set: &ManifestSet,
    ) -> Job {
        let this = self.clone();
        let harness = harness.clone();
        let ctx = ctx.clone();
        let set = set.clone();
        Job::from_future(async move {
            // deletes run sequentially; later sources may depend on earlier
            // ones still existing while their finalizers run
            if !set.resource_objects.is_empty() {
                let yaml = Self::objects_yaml(&harness, &ctx, &cluster, &set).await?;
                let args = Self::file_args(&set, true, "-", false);
                run_command(&ctx, this.command(cluster.as_ref(), &args), Some(yaml)).await?;
            }
            for resource in &set.resources {
                let args = Self::file_args(&set, true, "-", false);
                run_command(
                    &ctx,
                    this.command(cluster.as_ref(), &args),
                    Some(resource.clone()),
                )
                .await?;
            }
            for path in &set.resource_paths {
                let args = Self::file_args(&set, true, &path.display().to_string(), false);
                run_command(&ctx, this.command(cluster.as_ref(), &args), None).await?;
            }
            for dir in &set.resource_recursive_dirs {
                let args = Self::file_args(&set, true, &dir.display().to_string(), true);
                run_command(&ctx, this.command(cluster.as_ref(), &args), None).await?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_args_render_conditions_and_flags() {
        let wait = WaitFor {
            resource: "deployment/db".to_string(),
            conditions: std::collections::BTreeMap::from([
                ("condition".to_string(), "Available".to_string()),
                ("delete".to_string(), String::new()),
            ]),
            flags: vec!["--timeout=5m".to_string()],
        };
        assert_eq!(
            wait_args(&wait),
            vec![
                "wait",
                "deployment/db",
                "--for",
                "condition=Available",
                "--for",
                "delete",
                "--timeout=5m",
            ]
        );
    }

    mod file_args {
        use super::*;

        #[test]
        fn apply_is_server_side_with_yaml_output() {
            let set = ManifestSet::new("plain");
            assert_eq!(
                KubectlCli::file_args(&set, false, "-", false),
                vec![
                    "apply",
                    "--server-side",
                    "--output",
                    "yaml",
                    "--filename",
                    "-",
                ]
            );
        }

        #[test]
        fn create_mode_switches_verbs() {
            let set = ManifestSet {
                create: true,
                ..ManifestSet::new("created")
            };
            let args = KubectlCli::file_args(&set, false, "dir", true);
            assert_eq!(args[0], "create");
            assert!(args.contains(&"--recursive".to_string()));
        }

        #[test]
        fn replace_and_namespace_are_threaded() {
            let set = ManifestSet {
                replace: true,
                namespace: Some("apps".to_string()),
                ..ManifestSet::new("scoped")
            };
            let args = KubectlCli::file_args(&set, false, "-", false);
            assert!(args.contains(&"--replace".to_string()));
            let ns = args.iter().position(|a| a == "--namespace").unwrap();
            assert_eq!(args[ns + 1], "apps");
        }

        #[test]
        fn delete_honors_skip_delete_wait() {
            let set = ManifestSet {
                skip_delete_wait: true,
                ..ManifestSet::new("fast")
            };
            let args = KubectlCli::file_args(&set, true, "-", false);
            assert_eq!(args[0], "delete");
            assert!(args.contains(&"--wait=false".to_string()));
            // create/replace flags never leak into deletes
            assert!(!args.contains(&"--replace".to_string()));
        }
    }

    mod reported_objects {
        use super::*;

        #[test]
        fn single_document_is_one_object() {
            let objects =
                parse_reported_objects("kind: ConfigMap\nmetadata:\n  name: cm\n").unwrap();
            assert_eq!(objects.len(), 1);
            assert_eq!(objects[0]["kind"], "ConfigMap");
        }

        #[test]
        fn lists_flatten_into_items() {
            let yaml = r#"
kind: List
apiVersion: v1
items:
  - kind: Secret
    metadata:
      name: one
  - kind: Secret
    metadata:
      name: two
"#;
            let objects = parse_reported_objects(yaml).unwrap();
            assert_eq!(objects.len(), 2);
            assert_eq!(objects[1]["metadata"]["name"], "two");
        }

        #[test]
        fn multiple_documents_accumulate() {
            let yaml = "kind: A\n---\nkind: B\n";
            let objects = parse_reported_objects(yaml).unwrap();
            assert_eq!(objects.len(), 2);
        }

        #[test]
        fn empty_output_yields_nothing() {
            assert!(parse_reported_objects("").unwrap().is_empty());
        }
    }
}

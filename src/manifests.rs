//! Manifest-set descriptors and the manifest-handling contract
//!
//! A manifest set composes literal YAML strings, files, directories
//! (optionally recursive), and in-memory objects whose deferred values are
//! resolved at apply time. Ordering within a set is not guaranteed and
//! applies may run concurrently; authors needing sequencing should split
//! sets and declare dependencies.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::cluster::Cluster;
use crate::job::{Job, RunContext};
use crate::suite::Kindling;
use crate::value::NestedObject;

/// A `kubectl wait`-style readiness condition issued after an apply
#[derive(Clone, Debug, Default)]
pub struct WaitFor {
    /// The resource (or resource/name) to wait on
    pub resource: String,
    /// `--for` conditions; an empty value emits the key alone
    pub conditions: BTreeMap<String, String>,
    /// Extra flags for the wait command
    pub flags: Vec<String>,
}

impl WaitFor {
    /// Wait for a condition, e.g. `condition=Ready` on `pods`
    pub fn condition(resource: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            conditions: BTreeMap::from([(key.into(), value.into())]),
            flags: Vec::new(),
        }
    }
}

/// Sink receiving the objects a manifest apply reported back
pub type AppliedObjects = Arc<Mutex<Vec<serde_json::Value>>>;

/// A set of kubernetes manifests from literal strings, files, directories and
/// in-memory objects
#[derive(Clone, Debug, Default)]
pub struct ManifestSet {
    /// Human-readable name used in logs
    pub name: String,
    /// Namespace to apply into; the connection's default when absent
    pub namespace: Option<String>,
    /// In-memory objects; deferred values are resolved before serialization
    pub resource_objects: Vec<NestedObject>,
    /// Literal manifest documents
    pub resources: Vec<String>,
    /// Paths to individual resource files and (non-recursive) directories
    pub resource_paths: Vec<PathBuf>,
    /// Paths to directories recursively containing resource files
    pub resource_recursive_dirs: Vec<PathBuf>,
    /// Replace resources instead of patching them
    pub replace: bool,
    /// Create resources instead of applying them
    pub create: bool,
    /// Conditions to wait on after the apply completes
    pub wait: Vec<WaitFor>,
    /// Do not wait for deletion to finish during cleanup
    pub skip_delete_wait: bool,
    /// Leave the resources in place during cleanup
    pub skip_delete: bool,
    /// When present, receives every object the apply reported back
    pub applied: Option<AppliedObjects>,
}

impl ManifestSet {
    /// A named, empty manifest set
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Knows how to manage raw kubernetes manifests
pub trait Manifests: Send + Sync {
    /// Create or update a set of manifests
    fn create_or_update(
        &self,
        harness: &Kindling,
        ctx: &RunContext,
        cluster: Arc<dyn Cluster>,
        set: &ManifestSet,
    ) -> Job;

    /// Remove a set of manifests
    fn delete(
        &self,
        harness: &Kindling,
        ctx: &RunContext,
        cluster: Arc<dyn Cluster>,
        set: &ManifestSet,
    ) -> Job;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_for_condition_helper() {
        let wait = WaitFor::condition("pods", "condition", "Ready");
        assert_eq!(wait.resource, "pods");
        assert_eq!(wait.conditions.get("condition").unwrap(), "Ready");
    }

    #[test]
    fn test_applied_sink_is_shared() {
        let sink: AppliedObjects = Arc::default();
        let set = ManifestSet {
            applied: Some(sink.clone()),
            ..ManifestSet::new("shared")
        };
        set.applied
            .as_ref()
            .unwrap()
            .lock()
            .unwrap()
            .push(serde_json::json!({"kind": "ConfigMap"}));
        assert_eq!(sink.lock().unwrap().len(), 1);
    }
}

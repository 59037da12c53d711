//! Error types for the kindling orchestrator
//!
//! Errors are structured with fields to aid debugging when a suite fails.
//! Each variant carries contextual information like node ids, command lines,
//! and backend names.

use thiserror::Error;

/// Main error type for kindling operations
#[derive(Debug, Error)]
pub enum Error {
    /// The registered graph is invalid (cycle, dangling dependency, duplicate
    /// id, conflicting repo definitions, missing backend). Surfaced before
    /// any action runs.
    #[error("construction error: {message}")]
    Construction {
        /// Description of what's invalid
        message: String,
        /// The offending node id, if one can be named
        node: Option<String>,
    },

    /// A node's setup failed
    #[error("setup failed for {title}: {message}")]
    Setup {
        /// Human-readable node title
        title: String,
        /// Description of what failed
        message: String,
    },

    /// An external command exited unsuccessfully or could not be spawned
    #[error("command `{command}` failed: {message}")]
    Command {
        /// The command line that was executed
        command: String,
        /// Captured stderr or spawn failure
        message: String,
    },

    /// A deferred value could not be resolved or encoded
    #[error("value error: {message}")]
    Value {
        /// Description of what failed
        message: String,
    },

    /// Snapshot encoding/decoding failed
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Filesystem operation failed
    #[error("io error on {path}: {source}")]
    Io {
        /// The path being operated on
        path: String,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },

    /// The run context was cancelled.
    ///
    /// Not a failure at the engine boundary: nodes that unwind with this
    /// variant are neither recorded as the run error nor entered into the
    /// cleanup log.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Create a construction error with the given message
    pub fn construction(msg: impl Into<String>) -> Self {
        Self::Construction {
            message: msg.into(),
            node: None,
        }
    }

    /// Create a construction error naming the offending node
    pub fn construction_for(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Construction {
            message: msg.into(),
            node: Some(node.into()),
        }
    }

    /// Create a setup error with node title context
    pub fn setup(title: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Setup {
            title: title.into(),
            message: msg.into(),
        }
    }

    /// Create a command error from a command line and captured output
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create a value resolution/encoding error
    pub fn value(msg: impl Into<String>) -> Self {
        Self::Value {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an io error with path context
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Check whether this error is a cancellation.
    ///
    /// The engine treats cancelled nodes as unwound, not failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Get the node id if this error names one
    pub fn node(&self) -> Option<&str> {
        match self {
            Error::Construction { node, .. } => node.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: graph mistakes are caught before anything runs
    ///
    /// When an author wires a dependency to an id that was never registered,
    /// the construction error names the node so the mistake is findable.
    #[test]
    fn story_construction_errors_name_the_offending_node() {
        let err = Error::construction_for("node-42", "depends on unknown id node-99");
        assert!(err.to_string().contains("unknown id"));
        assert_eq!(err.node(), Some("node-42"));

        // Without a node, the accessor is empty but the message still reads
        let err = Error::construction("cycle detected");
        assert!(err.to_string().contains("cycle detected"));
        assert_eq!(err.node(), None);
    }

    /// Story: command failures keep the command line for reproduction
    #[test]
    fn story_command_errors_carry_the_command_line() {
        let err = Error::command("helm upgrade --install db", "context deadline exceeded");
        let msg = err.to_string();
        assert!(msg.contains("helm upgrade --install db"));
        assert!(msg.contains("context deadline exceeded"));
    }

    /// Story: cancellation is not a failure
    ///
    /// A node unwinding because the run context was cancelled must be
    /// distinguishable from a real error so the engine can ignore it.
    #[test]
    fn story_cancellation_is_classified() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::construction("x").is_cancelled());
        assert!(!Error::setup("Pulling image", "boom").is_cancelled());
    }

    #[test]
    fn test_setup_error_display() {
        let err = Error::setup("Building image registry.local/app", "exit status 1");
        assert!(err.to_string().contains("Building image registry.local/app"));
        assert!(err.to_string().contains("exit status 1"));
    }

    #[test]
    fn test_io_error_keeps_path() {
        let err = Error::io(
            "/tmp/kindling/archive.tar",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/kindling/archive.tar"));
    }
}

//! Error types for the lifecycle agent
//!
//! Errors carry the context needed to act on them: the stateroot, the
//! host program, or the path that failed. `is_retryable` separates
//! transient failures from hard ones that need a spec change or a human.

use std::path::PathBuf;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for lifecycle agent operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The OS deployment listing could not be obtained
    #[error("failed to query deployments: {message}")]
    Query {
        /// Description of what failed
        message: String,
    },

    /// A host program exited unsuccessfully or could not be spawned
    #[error("command {program} failed: {message}")]
    Command {
        /// Program that was invoked (e.g. "ostree", "podman")
        program: String,
        /// Captured stderr or spawn error
        message: String,
    },

    /// Filesystem operation failed
    #[error("io error at {}: {source}", path.display())]
    Io {
        /// Path the operation was applied to
        path: PathBuf,
        /// The underlying io error
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document being (de)serialized (if known)
        kind: Option<String>,
    },

    /// A removal selected a deployment that is currently booted
    #[error("failed abort: deployment {index} in stateroot {stateroot} is booted")]
    BootedConflict {
        /// Stateroot holding the booted deployment
        stateroot: String,
        /// Position of the booted deployment in the listing
        index: usize,
    },

    /// The deployment listing contains no booted deployment
    #[error("no booted deployment found")]
    NoBootedDeployment,

    /// Some stateroots could not be removed
    #[error("failed to remove {failed} stateroots")]
    StaterootCleanup {
        /// Number of stateroots that could not be removed
        failed: usize,
    },

    /// The seed image was built for a different release than requested
    #[error("version specified in seed image ({seed}) differs from version in spec ({requested})")]
    VersionMismatch {
        /// Version recorded in the seed image
        seed: String,
        /// Version requested by the user
        requested: String,
    },

    /// A versioned document is newer than this binary understands
    #[error("unsupported api version {found}, highest supported is {supported}")]
    UnsupportedApiVersion {
        /// Version found in the document
        found: u32,
        /// Highest version this binary understands
        supported: u32,
    },

    /// Image precaching failed
    #[error("precache error: {message}")]
    Precache {
        /// Description of what failed
        message: String,
    },

    /// Validation error for CR specs and user input
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.seedImageRef.version")
        field: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "cleanup")
        context: String,
    },
}

impl Error {
    /// Create a deployment query error
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query {
            message: msg.into(),
        }
    }

    /// Create a host command error
    pub fn command(program: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            message: msg.into(),
        }
    }

    /// Create an io error bound to the path it happened at
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a precache error
    pub fn precache(msg: impl Into<String>) -> Self {
        Self::Precache {
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    ///
    /// For simple validation errors without resource context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Invariant violations, version mismatches and validation errors need a
    /// human or a spec change. Query, command and io failures are retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Don't retry on 4xx errors (validation, not found, etc.)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Query { .. } => true,
            Error::Command { .. } => true,
            Error::Io { .. } => true,
            Error::Serialization { .. } => false,
            Error::BootedConflict { .. } => false,
            Error::NoBootedDeployment => false,
            Error::StaterootCleanup { .. } => true,
            Error::VersionMismatch { .. } => false,
            Error::UnsupportedApiVersion { .. } => false,
            Error::Precache { .. } => true,
            Error::Validation { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the stateroot name if this error concerns a specific stateroot
    pub fn stateroot(&self) -> Option<&str> {
        match self {
            Error::BootedConflict { stateroot, .. } => Some(stateroot),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error classification during upgrade operations
    // ==========================================================================

    /// Story: removing a booted deployment is reported with enough detail
    /// for an operator to see which stateroot was protected
    #[test]
    fn story_booted_conflict_names_stateroot_and_index() {
        let err = Error::BootedConflict {
            stateroot: "rhcos_4.15.0".to_string(),
            index: 1,
        };
        assert_eq!(
            err.to_string(),
            "failed abort: deployment 1 in stateroot rhcos_4.15.0 is booted"
        );
        assert_eq!(err.stateroot(), Some("rhcos_4.15.0"));
        assert!(!err.is_retryable());
    }

    /// Story: partial stateroot cleanup reports how many were left behind
    #[test]
    fn story_stateroot_cleanup_counts_failures() {
        let err = Error::StaterootCleanup { failed: 2 };
        assert_eq!(err.to_string(), "failed to remove 2 stateroots");
        assert!(err.is_retryable());
    }

    /// Story: a seed built for another release is a hard failure
    #[test]
    fn story_version_mismatch_is_not_retried() {
        let err = Error::VersionMismatch {
            seed: "4.15.0".to_string(),
            requested: "4.16.0".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "version specified in seed image (4.15.0) differs from version in spec (4.16.0)"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_host_failures_are_retryable() {
        assert!(Error::query("rpm-ostree status timed out").is_retryable());
        assert!(Error::command("ostree", "exit status 1").is_retryable());
        let io = Error::io(
            "/var/ibu",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(io.is_retryable());
        assert!(io.to_string().contains("/var/ibu"));
    }

    #[test]
    fn configuration_errors_are_permanent() {
        assert!(!Error::validation("bad stage").is_retryable());
        assert!(!Error::NoBootedDeployment.is_retryable());
        assert!(!Error::UnsupportedApiVersion {
            found: 2,
            supported: 1
        }
        .is_retryable());
        assert!(!Error::serialization("bad json").is_retryable());
    }

    #[test]
    fn validation_carries_field_path() {
        let err = Error::validation_for_field("upgrade", "spec.seedImageRef.version", "required");
        match &err {
            Error::Validation {
                resource, field, ..
            } => {
                assert_eq!(resource, "upgrade");
                assert_eq!(field.as_deref(), Some("spec.seedImageRef.version"));
            }
            _ => panic!("Expected Validation variant"),
        }
        assert!(err.to_string().contains("upgrade"));
    }

    #[test]
    fn internal_errors_expose_context() {
        let err = Error::internal_with_context("cleanup", "workspace busy");
        assert_eq!(err.context(), Some("cleanup"));
        assert_eq!(Error::internal("x").context(), Some(UNKNOWN_CONTEXT));
        assert_eq!(Error::query("x").context(), None);
    }

    #[test]
    fn json_errors_convert_to_serialization() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}

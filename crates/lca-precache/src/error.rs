//! Precache error types

use thiserror::Error;

/// Errors from precaching
#[derive(Debug, Error)]
pub enum PrecacheError {
    /// A single image could not be pulled
    #[error("failed to pull {image}: {message}")]
    Pull {
        /// Image reference
        image: String,
        /// Underlying failure
        message: String,
    },

    /// The task observed cancellation before finishing
    #[error("precaching cancelled")]
    Cancelled,

    /// Best-effort precaching finished without pulling a single image
    #[error("precaching incomplete: {failed} of {total} images failed to pull")]
    Incomplete {
        /// Images that failed
        failed: usize,
        /// Images requested
        total: usize,
    },

    /// A precache task is already running
    #[error("a precache task is already running")]
    AlreadyRunning,

    /// The worker panicked or was aborted by the runtime
    #[error("precache worker terminated abnormally: {0}")]
    Worker(String),
}

impl PrecacheError {
    /// Create a pull error
    pub fn pull(image: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Pull {
            image: image.into(),
            message: message.into(),
        }
    }
}

impl From<PrecacheError> for lca_common::Error {
    fn from(e: PrecacheError) -> Self {
        lca_common::Error::precache(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_into_common_error() {
        let err: lca_common::Error = PrecacheError::Incomplete {
            failed: 3,
            total: 3,
        }
        .into();
        assert!(matches!(err, lca_common::Error::Precache { .. }));
        assert!(err.to_string().contains("3 of 3"));
    }

    #[test]
    fn pull_error_names_image() {
        let err = PrecacheError::pull("quay.io/a:1", "manifest unknown");
        assert_eq!(err.to_string(), "failed to pull quay.io/a:1: manifest unknown");
    }
}

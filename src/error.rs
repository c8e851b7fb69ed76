//! Error taxonomy for routing and service reconciliation

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the library
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the reconciliation engines
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration file exists but does not parse. Never auto-repaired.
    #[error("corrupt configuration at {}: {source}", path.display())]
    CorruptConfig {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Replacement text for a document does not parse. The file was left untouched.
    #[error("refusing to write {}: document does not parse: {source}", path.display())]
    InvalidDocument {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// An operation was invoked before its prerequisite (e.g. toggling HTTP/3 before bootstrap)
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    /// The orchestrator could not be reached. Nothing was changed.
    #[error("orchestrator unavailable: {0}")]
    OrchestratorUnavailable(String),

    /// The service changed since it was inspected
    #[error("service '{service}' was modified concurrently (update sent against version {version})")]
    VersionConflict { service: String, version: u64 },

    /// The orchestrator refused the create or update request. Nothing was changed.
    #[error("orchestrator rejected the request for '{service}': {reason}")]
    UpdateRejected { service: String, reason: String },

    /// The connection failed while a create or update was in flight
    #[error("lost contact with the orchestrator while writing '{service}', its state is unknown: {reason}")]
    UpdateIndeterminate { service: String, reason: String },

    /// The image is missing locally and could not be pulled
    #[error("failed to pull image '{image}': {reason}")]
    ImagePullFailure { image: String, reason: String },

    /// Filesystem error while reading or writing a configuration file
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A document could not be serialized
    #[error("failed to serialize document: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Stable codes for reporting errors to administrative callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    CorruptConfig,
    InvalidDocument,
    PreconditionViolation,
    OrchestratorUnavailable,
    VersionConflict,
    UpdateRejected,
    UpdateIndeterminate,
    ImagePullFailure,
    Io,
    Serialize,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CorruptConfig => "CORRUPT_CONFIG",
            ErrorCode::InvalidDocument => "INVALID_DOCUMENT",
            ErrorCode::PreconditionViolation => "PRECONDITION_VIOLATION",
            ErrorCode::OrchestratorUnavailable => "ORCHESTRATOR_UNAVAILABLE",
            ErrorCode::VersionConflict => "VERSION_CONFLICT",
            ErrorCode::UpdateRejected => "UPDATE_REJECTED",
            ErrorCode::UpdateIndeterminate => "UPDATE_INDETERMINATE",
            ErrorCode::ImagePullFailure => "IMAGE_PULL_FAILURE",
            ErrorCode::Io => "IO_ERROR",
            ErrorCode::Serialize => "SERIALIZE_ERROR",
        }
    }
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionViolation(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::CorruptConfig { .. } => ErrorCode::CorruptConfig,
            Error::InvalidDocument { .. } => ErrorCode::InvalidDocument,
            Error::PreconditionViolation(_) => ErrorCode::PreconditionViolation,
            Error::OrchestratorUnavailable(_) => ErrorCode::OrchestratorUnavailable,
            Error::VersionConflict { .. } => ErrorCode::VersionConflict,
            Error::UpdateRejected { .. } => ErrorCode::UpdateRejected,
            Error::UpdateIndeterminate { .. } => ErrorCode::UpdateIndeterminate,
            Error::ImagePullFailure { .. } => ErrorCode::ImagePullFailure,
            Error::Io { .. } => ErrorCode::Io,
            Error::Serialize(_) => ErrorCode::Serialize,
        }
    }

    /// Whether the orchestrator may have applied part of a request.
    ///
    /// Every other error guarantees that nothing changed.
    pub fn state_unknown(&self) -> bool {
        matches!(self, Error::UpdateIndeterminate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = Error::VersionConflict {
            service: "dokploy-traefik".to_string(),
            version: 7,
        };
        assert_eq!(err.code(), ErrorCode::VersionConflict);
        assert_eq!(err.code().as_str(), "VERSION_CONFLICT");

        let err = Error::precondition("bootstrap first");
        assert_eq!(err.code().as_str(), "PRECONDITION_VIOLATION");
    }

    #[test]
    fn test_only_indeterminate_leaves_state_unknown() {
        let indeterminate = Error::UpdateIndeterminate {
            service: "svc".to_string(),
            reason: "connection reset".to_string(),
        };
        assert!(indeterminate.state_unknown());

        let rejected = Error::UpdateRejected {
            service: "svc".to_string(),
            reason: "invalid mount".to_string(),
        };
        assert!(!rejected.state_unknown());
        assert!(!Error::OrchestratorUnavailable("down".to_string()).state_unknown());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::VersionConflict {
            service: "dokploy-traefik".to_string(),
            version: 12,
        };
        let msg = err.to_string();
        assert!(msg.contains("dokploy-traefik"));
        assert!(msg.contains("12"));

        let err = Error::ImagePullFailure {
            image: "traefik:v3.1.2".to_string(),
            reason: "manifest unknown".to_string(),
        };
        assert!(err.to_string().contains("traefik:v3.1.2"));
    }
}

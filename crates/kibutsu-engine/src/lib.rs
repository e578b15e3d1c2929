use bollard::errors::Error as BollardError; // Alias bollard error
use kibutsu_common::ComposeError;
use std::time::Duration;
use thiserror::Error;

// Re-export dependencies potentially needed by consumers (like the orchestrator)
pub use bollard;
pub use kibutsu_common as common;

pub mod docker;
pub mod gateway;
pub mod memory;
pub mod test_utils;

pub use docker::DockerGateway;
pub use gateway::{
    ContainerSpec, ContainerSummary, EngineEvent, EngineGateway, EngineStream, LabelFilter,
    LogChunk, LogOptions, MountKind, MountSpec, NetworkSummary, VolumeSummary,
};
pub use memory::{EngineOp, MemoryEngine};

// --- Custom Error Type ---
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Engine unreachable: {0}")]
    Unavailable(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("Engine API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Engine error: {0}")]
    Other(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

impl From<BollardError> for EngineError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => match status_code {
                404 => EngineError::NotFound(message),
                409 if message.contains("already exists") || message.contains("already in use") => {
                    EngineError::AlreadyExists(message)
                }
                409 => EngineError::Conflict(message),
                status => EngineError::Api { status, message },
            },
            BollardError::RequestTimeoutError => EngineError::Timeout {
                operation: "engine request",
                after: Duration::ZERO,
            },
            BollardError::IOError { err } => EngineError::Unavailable(err.to_string()),
            BollardError::SocketNotFoundError(path) => {
                EngineError::Unavailable(format!("socket not found: {path}"))
            }
            BollardError::HyperResponseError { err } => EngineError::Unavailable(err.to_string()),
            other => EngineError::Other(other.to_string()),
        }
    }
}

// Implement conversion from EngineError to the common ComposeError
impl From<EngineError> for ComposeError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable(msg) => ComposeError::EngineUnavailable(msg),
            EngineError::NotFound(msg) => ComposeError::NotFound(msg),
            other => ComposeError::Engine(other.to_string()),
        }
    }
}

// Define local Result using the crate's Error type
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_distinguishable() {
        let not_found = EngineError::from(BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: abc".into(),
        });
        assert!(not_found.is_not_found());

        let exists = EngineError::from(BollardError::DockerResponseServerError {
            status_code: 409,
            message: "network with name demo_default already exists".into(),
        });
        assert!(matches!(exists, EngineError::AlreadyExists(_)));

        let conflict = EngineError::from(BollardError::DockerResponseServerError {
            status_code: 409,
            message: "error while removing network: has active endpoints".into(),
        });
        assert!(matches!(conflict, EngineError::Conflict(_)));

        let server = EngineError::from(BollardError::DockerResponseServerError {
            status_code: 500,
            message: "driver failed".into(),
        });
        assert_eq!(
            server,
            EngineError::Api {
                status: 500,
                message: "driver failed".into()
            }
        );
    }

    #[test]
    fn test_unavailable_maps_to_engine_unavailable() {
        let err: ComposeError = EngineError::Unavailable("connection refused".into()).into();
        assert!(matches!(err, ComposeError::EngineUnavailable(_)));
        let err: ComposeError = EngineError::NotFound("demo".into()).into();
        assert!(matches!(err, ComposeError::NotFound(_)));
    }
}

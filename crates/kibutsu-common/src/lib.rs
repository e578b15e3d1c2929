// Shared types for the kibutsu workspace: project model, operation results and errors.

use thiserror::Error;

mod model;
mod names;
mod outcome;

pub use model::*;
pub use names::{validate_name, validate_project_name, MAX_NAME_LEN};
pub use outcome::*;
pub use serde::{Deserialize, Serialize};

#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Project {project} is busy with {operation}")]
    ProjectBusy {
        project: String,
        operation: OperationKind,
    },

    #[error("No recorded spec for service {service} in project {project}; bring it up first")]
    SpecUnavailable { project: String, service: String },

    #[error("Operation {} on {} was {}", .0.operation, .0.project, .0.status)]
    PartialFailure(Box<OperationResult>),

    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Invalid project descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation deadline exceeded")]
    DeadlineExceeded,
}

impl ComposeError {
    /// True for failures raised before any engine call was made.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ComposeError::ProjectBusy { .. }
                | ComposeError::InvalidName { .. }
                | ComposeError::InvalidDescriptor(_)
                | ComposeError::SpecUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ComposeError>;

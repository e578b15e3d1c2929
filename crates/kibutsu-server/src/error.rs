use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kibutsu_common::{ApplyStatus, ComposeError};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Error body for everything that is not an operation result.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum ApiError {
    Compose(ComposeError),
    BadRequest(String),
}

impl From<ComposeError> for ApiError {
    fn from(err: ComposeError) -> Self {
        ApiError::Compose(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Compose(err) => status_for(err),
        }
    }
}

pub fn status_for(err: &ComposeError) -> StatusCode {
    match err {
        ComposeError::NotFound(_) => StatusCode::NOT_FOUND,
        ComposeError::ProjectBusy { .. } | ComposeError::SpecUnavailable { .. } => StatusCode::CONFLICT,
        ComposeError::InvalidName { .. } | ComposeError::InvalidDescriptor(_) => StatusCode::BAD_REQUEST,
        ComposeError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ComposeError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ComposeError::PartialFailure(result) => match result.status {
            ApplyStatus::Applied => StatusCode::OK,
            ApplyStatus::PartiallyApplied => StatusCode::MULTI_STATUS,
            ApplyStatus::Failed => StatusCode::BAD_GATEWAY,
        },
        ComposeError::Engine(_) => StatusCode::BAD_GATEWAY,
        // The caller went away; nobody reads this
        ComposeError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
    }
}

fn code_for(err: &ComposeError) -> &'static str {
    match err {
        ComposeError::NotFound(_) => "not_found",
        ComposeError::ProjectBusy { .. } => "project_busy",
        ComposeError::SpecUnavailable { .. } => "spec_unavailable",
        ComposeError::PartialFailure(_) => "partial_failure",
        ComposeError::EngineUnavailable(_) => "engine_unavailable",
        ComposeError::InvalidName { .. } => "invalid_name",
        ComposeError::InvalidDescriptor(_) => "invalid_descriptor",
        ComposeError::Engine(_) => "engine_error",
        ComposeError::Cancelled => "cancelled",
        ComposeError::DeadlineExceeded => "deadline_exceeded",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            // Partial and failed operations carry the whole result
            ApiError::Compose(ComposeError::PartialFailure(result)) => {
                warn!(project = %result.project, operation = %result.operation, %status, "Operation not fully applied");
                (status, Json(*result)).into_response()
            }
            ApiError::Compose(err) => {
                if status.is_server_error() {
                    error!(%status, "Request failed: {}", err);
                }
                let body = ErrorBody {
                    error: err.to_string(),
                    code: code_for(&err).to_string(),
                };
                (status, Json(body)).into_response()
            }
            ApiError::BadRequest(message) => {
                let body = ErrorBody {
                    error: message,
                    code: "bad_request".to_string(),
                };
                (status, Json(body)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kibutsu_common::{OperationKind, OperationResult, ResourceKind};

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&ComposeError::NotFound("demo".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&ComposeError::ProjectBusy {
                project: "demo".into(),
                operation: OperationKind::Up,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ComposeError::EngineUnavailable("socket".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(&ComposeError::DeadlineExceeded), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(&ComposeError::InvalidDescriptor("dup".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_partial_results_keep_their_status() {
        let mut result = OperationResult::new("demo", OperationKind::Down);
        result.record_failure(ResourceKind::Network, "demo_default", "in use");
        let failed = result.clone().finish();
        assert_eq!(
            status_for(&ComposeError::PartialFailure(Box::new(failed))),
            StatusCode::BAD_GATEWAY
        );

        result.record_change(
            ResourceKind::Container,
            "demo_web_0",
            kibutsu_common::ChangeAction::Removed,
        );
        let partial = result.finish();
        assert_eq!(
            status_for(&ComposeError::PartialFailure(Box::new(partial))),
            StatusCode::MULTI_STATUS
        );
    }
}

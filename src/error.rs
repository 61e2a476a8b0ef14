use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("publish plan not found: {0}")]
    PlanNotFound(String),

    #[error("unresolved placeholder reference: no record id for folder '{folder_path}', file '{filename}'")]
    UnresolvedReference { folder_path: String, filename: String },

    #[error("data folder not found: {0}")]
    FolderNotFound(String),

    #[error("connector account not found: {0}")]
    ConnectorAccountNotFound(String),

    #[error("file '{0}' is not inside a known data folder")]
    NoDataFolder(String),

    #[error("plan {plan_id} cannot be {action} while {status}")]
    InvalidPlanState {
        plan_id: String,
        action: &'static str,
        status: String,
    },
}

#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED",
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_REQUEST",
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "QUEUE_UNAVAILABLE",
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::PlanNotFound(_)) => Self {
                status: StatusCode::NOT_FOUND,
                code: "PLAN_NOT_FOUND",
                message: err.to_string(),
            },
            Some(PipelineError::FolderNotFound(_) | PipelineError::ConnectorAccountNotFound(_)) => {
                Self {
                    status: StatusCode::NOT_FOUND,
                    code: "NOT_FOUND",
                    message: err.to_string(),
                }
            }
            Some(PipelineError::InvalidPlanState { .. }) => Self {
                status: StatusCode::CONFLICT,
                code: "INVALID_PLAN_STATE",
                message: err.to_string(),
            },
            _ => {
                error!("Request failed: {err:#}");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "INTERNAL_ERROR",
                    message: format!("{err:#}"),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": {
                    "code": self.code,
                    "message": self.message
                }
            })),
        )
            .into_response()
    }
}

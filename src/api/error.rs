//! Unified error handling for the API

use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::{ControllerError, ManagerError, StoreError};

/// API error response body
#[derive(Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
}

/// Application error types
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        };

        (
            status,
            Json(ApiError {
                error: message,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => AppError::NotFound(err.to_string()),
            StoreError::InvalidTransition { .. } => AppError::Conflict(err.to_string()),
            StoreError::Invalid(_) => AppError::BadRequest(err.to_string()),
            other => {
                tracing::error!("Store error: {:?}", other);
                AppError::Internal(other.to_string())
            }
        }
    }
}

impl From<ControllerError> for AppError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::InvalidState { .. } => AppError::Conflict(err.to_string()),
            ControllerError::Store(e) => e.into(),
            ControllerError::RoleDefinitionNotFound { .. } | ControllerError::Process(_) => {
                tracing::error!("Agent process error: {}", err);
                AppError::Internal(err.to_string())
            }
        }
    }
}

impl From<ManagerError> for AppError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::UnknownAgent(_) | ManagerError::NotRunning(_) => {
                AppError::NotFound(err.to_string())
            }
            ManagerError::AlreadyRunning { .. } => AppError::Conflict(err.to_string()),
            ManagerError::Controller(e) => e.into(),
            ManagerError::Store(e) => e.into(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Log full error chain for debugging, return sanitized message to client
        tracing::error!("Internal error: {:?}", err);
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::types::ControllerState;

    #[test]
    fn manager_errors_map_to_status_codes() {
        let cases = [
            (ManagerError::UnknownAgent("ghost".into()), StatusCode::NOT_FOUND),
            (ManagerError::NotRunning("qa".into()), StatusCode::NOT_FOUND),
            (
                ManagerError::AlreadyRunning {
                    name: "qa".into(),
                    state: ControllerState::Running,
                },
                StatusCode::CONFLICT,
            ),
            (
                ManagerError::Controller(ControllerError::InvalidState {
                    op: "pause",
                    state: ControllerState::Idle,
                }),
                StatusCode::CONFLICT,
            ),
            (
                ManagerError::Store(StoreError::NotFound {
                    entity: "task",
                    id: "t-1".into(),
                }),
                StatusCode::NOT_FOUND,
            ),
        ];
        for (err, expected) in cases {
            let response = AppError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn invalid_input_is_a_bad_request() {
        let response = AppError::from(StoreError::Invalid("title is required".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

//! Error responses shared by the API handlers.

use axum::{http::StatusCode, Json};
use serde::Serialize;
use gradeflow_core::EngineError;

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Stable machine-readable error class
    pub code: &'static str,
}

/// Rejection returned by every fallible handler.
pub type ApiError = (StatusCode, Json<ErrorResponse>);

fn respond(status: StatusCode, code: &'static str, message: String) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message,
            code,
        }),
    )
}

/// Map an engine error to its HTTP status.
pub fn engine_error(err: EngineError) -> ApiError {
    let message = err.to_string();
    match err {
        EngineError::NotFound { .. } => respond(StatusCode::NOT_FOUND, "not_found", message),
        EngineError::InvalidTransition(_) => {
            respond(StatusCode::CONFLICT, "invalid_transition", message)
        }
        EngineError::NoEligibleWork { .. } => {
            respond(StatusCode::CONFLICT, "no_eligible_work", message)
        }
        EngineError::Conflict { .. } => respond(StatusCode::CONFLICT, "conflict", message),
        EngineError::Validation(_) => {
            respond(StatusCode::UNPROCESSABLE_ENTITY, "validation", message)
        }
        EngineError::Store(_) | EngineError::Scheduler(_) => {
            tracing::error!("Engine error: {}", message);
            respond(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
        }
    }
}

pub fn bad_request(message: impl Into<String>) -> ApiError {
    respond(StatusCode::BAD_REQUEST, "bad_request", message.into())
}

pub fn internal_error(message: impl Into<String>) -> ApiError {
    let message = message.into();
    tracing::error!("Internal error: {}", message);
    respond(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

/// Parse an optional status query parameter.
pub fn parse_status<T>(raw: Option<&str>) -> Result<Option<T>, ApiError>
where
    T: std::str::FromStr<Err = String>,
{
    raw.map(|s| s.parse::<T>().map_err(bad_request)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gradeflow_core::{Action, EntityKind, TransitionError, WorkStatus};

    #[test]
    fn test_status_mapping() {
        let (status, body) = engine_error(EngineError::NotFound {
            kind: "batch",
            id: "b1".to_string(),
        });
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, "not_found");

        let (status, _) = engine_error(EngineError::InvalidTransition(TransitionError::Work {
            kind: EntityKind::Job,
            from: WorkStatus::Completed,
            action: Action::Pause,
        }));
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = engine_error(EngineError::NoEligibleWork {
            kind: EntityKind::Batch,
            id: "b1".to_string(),
        });
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.code, "no_eligible_work");

        let (status, _) = engine_error(EngineError::Validation("bad".to_string()));
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = engine_error(EngineError::Store("disk".to_string()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_parse_status() {
        let parsed: Option<WorkStatus> = parse_status(Some("paused")).unwrap();
        assert_eq!(parsed, Some(WorkStatus::Paused));

        let missing: Option<WorkStatus> = parse_status(None).unwrap();
        assert_eq!(missing, None);

        let err = parse_status::<WorkStatus>(Some("bogus")).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }
}

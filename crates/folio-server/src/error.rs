use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use folio_engine::EngineError;

/// HTTP-facing error: a status code plus `{error, kind}` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: String,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request".into(),
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::SessionCorrupt { .. } | EngineError::SessionBusy { .. } => {
                StatusCode::CONFLICT
            }
            EngineError::UnknownContinuation => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: e.error_kind().to_string(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(kind = %self.kind, error = %self.message, "request failed");
        }
        let body = Json(json!({ "error": self.message, "kind": self.kind }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::ids::SessionId;

    #[test]
    fn engine_errors_map_to_status() {
        let id = SessionId::from_raw("sess_1");
        assert_eq!(
            ApiError::from(EngineError::SessionNotFound(id.clone())).status,
            StatusCode::NOT_FOUND
        );
        let corrupt = ApiError::from(EngineError::SessionCorrupt {
            session_id: id,
            reason: "bad json".into(),
        });
        assert_eq!(corrupt.status, StatusCode::CONFLICT);
        assert_eq!(corrupt.kind, "session_corrupt");
        assert_eq!(
            ApiError::from(EngineError::Internal("x".into())).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

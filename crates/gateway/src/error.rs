use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    pylon_common::GatewayError,
};

/// Maps core errors onto HTTP statuses with retry guidance for callers.
pub(crate) struct ApiError(pub GatewayError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, retryable) = match &self.0 {
            // Caller should re-ensure or wait, then try again.
            GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, true),
            GatewayError::NotReady(_) => (StatusCode::CONFLICT, true),
            // Operator-visible failure state; retrying won't help.
            GatewayError::MaxRetriesExceeded(_) => (StatusCode::SERVICE_UNAVAILABLE, false),
            // The background retry owns recovery; poll status instead.
            GatewayError::SessionInit { .. } | GatewayError::Send { .. } => {
                (StatusCode::BAD_GATEWAY, true)
            },
            GatewayError::StorageWrite { .. } => (StatusCode::INTERNAL_SERVER_ERROR, false),
        };
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "retryable": retryable,
        }));
        (status, body).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

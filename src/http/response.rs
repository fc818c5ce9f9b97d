//! Response envelope of the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Body of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u16,
    pub message: String,
}

/// Every non-streaming response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub status_code: u16,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status_code: 200,
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn failed(code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code: code,
            success: false,
            data: None,
            error: Some(ApiError {
                code,
                message: message.into(),
            }),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// Message shown to the client; worker errors pass through unchanged.
pub(crate) fn client_message(error: &GatewayError) -> String {
    match error {
        GatewayError::Worker(e) => e.message.clone(),
        other => other.to_string(),
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code >= 500 {
            tracing::error!(code, error = %self, "Request failed");
        } else {
            tracing::warn!(code, error = %self, "Request rejected");
        }
        ApiResponse::failed(code, client_message(&self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use serde_json::json;

    #[test]
    fn test_success_shape() {
        let body = serde_json::to_value(ApiResponse::ok(json!([1, 2]))).unwrap();
        assert_eq!(body, json!({"statusCode": 200, "success": true, "data": [1, 2]}));
    }

    #[test]
    fn test_error_shape() {
        let response = GatewayError::ServiceUnavailable("resource".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = serde_json::to_value(ApiResponse::failed(404, "note n1 not found")).unwrap();
        assert_eq!(
            body,
            json!({
                "statusCode": 404,
                "success": false,
                "error": {"code": 404, "message": "note n1 not found"}
            })
        );
    }

    #[test]
    fn test_worker_message_passes_through() {
        let err = GatewayError::Worker(WorkerError::not_found("note n1 not found"));
        assert_eq!(client_message(&err), "note n1 not found");
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use shared::types::DnsRecord;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Unsupported: {0}")]
    UnsupportedFeature(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream {} unavailable: {reason}", .record.hostname)]
    UpstreamUnavailable {
        record: Box<DnsRecord>,
        reason: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Authorization(_) => StatusCode::FORBIDDEN,
            GatewayError::UnsupportedFeature(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(e: anyhow::Error) -> Self {
        GatewayError::Internal(format!("{:#}", e))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            GatewayError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                json!({
                    "error": "Internal server error",
                    "status": status.as_u16(),
                })
            }
            GatewayError::UpstreamUnavailable { record, reason } => {
                tracing::warn!("Upstream {} unavailable: {}", record.hostname, reason);
                json!({
                    "error": self.to_string(),
                    "status": status.as_u16(),
                    "record": record,
                })
            }
            other => json!({
                "error": other.to_string(),
                "status": status.as_u16(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

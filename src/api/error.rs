//! HTTP mapping for control-plane errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::Error;
use crate::transport::TransportError;

/// Wrapper so handlers can `?` crate errors into responses.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            Error::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            Error::UnsupportedCorePair { .. } => (StatusCode::BAD_REQUEST, "unsupported_core_pair"),
            Error::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Error::PortConflict { .. } => (StatusCode::CONFLICT, "port_conflict"),
            Error::SwitchInProgress { .. } => (StatusCode::CONFLICT, "switch_in_progress"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::InvalidToken => (StatusCode::UNAUTHORIZED, "invalid_token"),
            Error::Transport(TransportError::Unreachable(_)) => {
                (StatusCode::BAD_GATEWAY, "agent_unreachable")
            }
            Error::Transport(TransportError::Timeout(_)) => {
                (StatusCode::GATEWAY_TIMEOUT, "agent_timeout")
            }
            Error::Transport(TransportError::Rejected { .. }) => {
                (StatusCode::BAD_GATEWAY, "agent_rejected")
            }
            Error::VerificationFailed(_) => (StatusCode::BAD_GATEWAY, "verification_failed"),
            Error::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "cancelled"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.parts().0
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.parts();
        if status.is_server_error() {
            log::error!("Request failed: {}", self.0);
        }

        let body = serde_json::json!({
            "error": kind,
            "message": self.0.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::invalid_input("x"), StatusCode::BAD_REQUEST),
            (Error::PortConflict { port: 443 }, StatusCode::CONFLICT),
            (
                Error::SwitchInProgress {
                    host_id: uuid::Uuid::nil(),
                },
                StatusCode::CONFLICT,
            ),
            (Error::not_found("host"), StatusCode::NOT_FOUND),
            (Error::InvalidToken, StatusCode::UNAUTHORIZED),
            (
                Error::Transport(TransportError::Timeout("30s".into())),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                Error::Transport(TransportError::Rejected {
                    status: 500,
                    body: "boom".into(),
                }),
                StatusCode::BAD_GATEWAY,
            ),
            (Error::Cancelled, StatusCode::SERVICE_UNAVAILABLE),
            (Error::storage("down"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }

    #[test]
    fn test_rejected_detail_is_surfaced() {
        let err = ApiError(Error::Transport(TransportError::Rejected {
            status: 422,
            body: "bad inbound".into(),
        }));
        assert!(err.0.to_string().contains("bad inbound"));
    }
}

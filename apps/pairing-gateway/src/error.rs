use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use gsm_session::{DispatchError, FailureKind, FailureReason, Phase, SendResult};
use serde::Serialize;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("no pairing code is available")]
    PairingUnavailable,
    #[error("restart is not applicable while {0}")]
    RestartRejected(Phase),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("failed to render pairing code")]
    Render(#[source] anyhow::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Dispatch(err) => match err.kind() {
                FailureKind::ValidationError => StatusCode::BAD_REQUEST,
                FailureKind::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
                FailureKind::LoggedOutFatal => StatusCode::GONE,
                FailureKind::ProviderError => StatusCode::BAD_GATEWAY,
            },
            GatewayError::PairingUnavailable => StatusCode::NOT_FOUND,
            GatewayError::RestartRejected(_) => StatusCode::CONFLICT,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Dispatch(err) => err.kind().as_str(),
            GatewayError::PairingUnavailable => "pairing_unavailable",
            GatewayError::RestartRejected(_) => "restart_rejected",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::Render(_) => "internal",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::Render(err) = &self {
            error!(error = %format!("{err:#}"), "pairing code render failed");
        }
        (self.status(), Json(self.body())).into_response()
    }
}

impl GatewayError {
    /// Send failures carry the same `failureReason` as a bulk result entry.
    fn body(&self) -> ErrorBody {
        let (pairing, failure_reason) = match self {
            GatewayError::Dispatch(err) => {
                (err.pairing_path(), SendResult::failed(err).failure_reason)
            }
            _ => (None, None),
        };
        ErrorBody {
            success: false,
            error: self.to_string(),
            kind: self.kind(),
            failure_reason,
            pairing,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    kind: &'static str,
    #[serde(rename = "failureReason", skip_serializing_if = "Option::is_none")]
    failure_reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pairing: Option<&'static str>,
}

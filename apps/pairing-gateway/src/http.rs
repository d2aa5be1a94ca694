use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use gsm_session::{
    ConnectionManager, OutboundDispatcher, PairingView, SendRequest, SendResult, StatusSnapshot,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::{
    error::GatewayError,
    render::{CodeRenderer, png_data_url},
};

pub const MAX_BULK_MESSAGES: usize = 100;

#[derive(Clone)]
pub struct GatewayState {
    pub manager: ConnectionManager,
    pub dispatcher: OutboundDispatcher,
    pub renderer: Arc<dyn CodeRenderer>,
}

impl GatewayState {
    pub fn new(dispatcher: OutboundDispatcher, renderer: Arc<dyn CodeRenderer>) -> Self {
        Self {
            manager: dispatcher.manager().clone(),
            dispatcher,
            renderer,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PairingResponse {
    Pending {
        code: String,
        image: String,
        #[serde(with = "time::serde::rfc3339")]
        issued_at: OffsetDateTime,
    },
    Connected,
    NotReady,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct BulkSendRequest {
    #[serde(default)]
    pub messages: Vec<SendRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkSendResponse {
    pub results: Vec<SendResult>,
}

#[derive(Debug, Serialize)]
pub struct RestartResponse {
    pub status: &'static str,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/pairing", get(pairing))
        .route("/pairing.png", get(pairing_png))
        .route("/send", post(send))
        .route("/send/bulk", post(send_bulk))
        .route("/restart", post(restart))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn status(State(state): State<GatewayState>) -> Json<StatusSnapshot> {
    Json(state.manager.status())
}

pub async fn handle_pairing(
    state: &GatewayState,
) -> Result<(StatusCode, PairingResponse), GatewayError> {
    match state.manager.pairing().await {
        PairingView::Connected => Ok((StatusCode::OK, PairingResponse::Connected)),
        PairingView::NotReady => Ok((StatusCode::ACCEPTED, PairingResponse::NotReady)),
        PairingView::Pending(code) => {
            let png = state.renderer.png(&code.data).map_err(GatewayError::Render)?;
            Ok((
                StatusCode::OK,
                PairingResponse::Pending {
                    image: png_data_url(&png),
                    code: code.data,
                    issued_at: code.issued_at,
                },
            ))
        }
    }
}

async fn pairing(State(state): State<GatewayState>) -> Result<Response, GatewayError> {
    let (status, body) = handle_pairing(&state).await?;
    Ok((status, Json(body)).into_response())
}

async fn pairing_png(State(state): State<GatewayState>) -> Result<Response, GatewayError> {
    let PairingView::Pending(code) = state.manager.pairing().await else {
        return Err(GatewayError::PairingUnavailable);
    };
    let png = state.renderer.png(&code.data).map_err(GatewayError::Render)?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        png,
    )
        .into_response())
}

pub async fn handle_send(
    state: &GatewayState,
    request: SendRequest,
) -> Result<SendResult, GatewayError> {
    let receipt = state.dispatcher.send(request).await?;
    Ok(SendResult::delivered(receipt.provider_message_id))
}

async fn send(
    State(state): State<GatewayState>,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendResult>, GatewayError> {
    handle_send(&state, request).await.map(Json)
}

/// Dispatches each message in order; one failure does not stop the rest.
pub async fn handle_bulk(
    state: &GatewayState,
    request: BulkSendRequest,
) -> Result<BulkSendResponse, GatewayError> {
    if request.messages.is_empty() {
        return Err(GatewayError::BadRequest("messages must not be empty".into()));
    }
    if request.messages.len() > MAX_BULK_MESSAGES {
        return Err(GatewayError::BadRequest(format!(
            "at most {MAX_BULK_MESSAGES} messages per request"
        )));
    }

    let mut results = Vec::with_capacity(request.messages.len());
    for message in request.messages {
        results.push(state.dispatcher.dispatch(message).await);
    }
    let delivered = results.iter().filter(|result| result.success).count();
    info!(total = results.len(), delivered, "bulk send finished");
    Ok(BulkSendResponse { results })
}

async fn send_bulk(
    State(state): State<GatewayState>,
    Json(request): Json<BulkSendRequest>,
) -> Result<Json<BulkSendResponse>, GatewayError> {
    handle_bulk(&state, request).await.map(Json)
}

async fn restart(State(state): State<GatewayState>) -> Result<Response, GatewayError> {
    if state.manager.restart().await {
        info!("manual session restart requested");
        return Ok((
            StatusCode::ACCEPTED,
            Json(RestartResponse {
                status: "restarting",
            }),
        )
            .into_response());
    }
    Err(GatewayError::RestartRejected(state.manager.phase().await))
}

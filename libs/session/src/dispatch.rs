use std::time::{Duration, Instant};

use gsm_telemetry::{TelemetryLabels, record_counter, record_histogram, with_common_fields};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{Instrument, field::Empty, info, info_span, warn};
use unicode_segmentation::UnicodeSegmentation;

use crate::{
    manager::{ConnectionManager, SessionUnavailable},
    state::Phase,
};

pub const PAIRING_PATH: &str = "/pairing";
pub const MIN_RECIPIENT_DIGITS: usize = 10;
pub const DEFAULT_PREVIEW_CHARS: usize = 32;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub body: String,
}

impl SendRequest {
    pub fn new(recipient: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSend {
    pub recipient_id: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("recipient must contain at least {min} digits, found {found}")]
    RecipientTooShort { min: usize, found: usize },
    #[error("message body must not be empty")]
    EmptyBody,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("session is not connected (phase {phase}); fetch a pairing code from {pairing}")]
    NotConnected { phase: Phase, pairing: &'static str },
    #[error("session was logged out; re-pair via {pairing}")]
    LoggedOut { pairing: &'static str },
    #[error("provider error: {0}")]
    Provider(String),
}

impl DispatchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) => FailureKind::ValidationError,
            Self::NotConnected { .. } => FailureKind::NotConnected,
            Self::LoggedOut { .. } => FailureKind::LoggedOutFatal,
            Self::Provider(_) => FailureKind::ProviderError,
        }
    }

    /// Both flavours of "no live session" count here.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected { .. } | Self::LoggedOut { .. })
    }

    pub fn pairing_path(&self) -> Option<&'static str> {
        match self {
            Self::NotConnected { pairing, .. } | Self::LoggedOut { pairing } => Some(pairing),
            _ => None,
        }
    }
}

impl From<SessionUnavailable> for DispatchError {
    fn from(value: SessionUnavailable) -> Self {
        if value.logged_out {
            Self::LoggedOut {
                pairing: PAIRING_PATH,
            }
        } else {
            Self::NotConnected {
                phase: value.phase,
                pairing: PAIRING_PATH,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ValidationError,
    NotConnected,
    ProviderError,
    LoggedOutFatal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::NotConnected => "not_connected",
            Self::ProviderError => "provider_error",
            Self::LoggedOutFatal => "logged_out_fatal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

impl SendResult {
    pub fn delivered(provider_message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            provider_message_id: Some(provider_message_id.into()),
            failure_reason: None,
        }
    }

    pub fn failed(err: &DispatchError) -> Self {
        Self {
            success: false,
            provider_message_id: None,
            failure_reason: Some(FailureReason {
                kind: err.kind(),
                message: err.to_string(),
            }),
        }
    }
}

impl From<Result<SendReceipt, DispatchError>> for SendResult {
    fn from(value: Result<SendReceipt, DispatchError>) -> Self {
        match value {
            Ok(receipt) => Self::delivered(receipt.provider_message_id),
            Err(err) => Self::failed(&err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub recipient_id: String,
    pub provider_message_id: String,
}

/// Strips everything but ASCII digits from `raw`.
pub fn normalize_recipient(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

pub fn normalize(request: &SendRequest) -> Result<NormalizedSend, ValidationError> {
    let recipient_id = normalize_recipient(&request.recipient);
    if recipient_id.len() < MIN_RECIPIENT_DIGITS {
        return Err(ValidationError::RecipientTooShort {
            min: MIN_RECIPIENT_DIGITS,
            found: recipient_id.len(),
        });
    }
    if request.body.is_empty() {
        return Err(ValidationError::EmptyBody);
    }
    Ok(NormalizedSend {
        recipient_id,
        body: request.body.clone(),
    })
}

/// Bounded, grapheme-safe excerpt of a message body for logs.
pub fn preview(body: &str, max_graphemes: usize) -> String {
    let mut graphemes = body.graphemes(true);
    let head: String = graphemes.by_ref().take(max_graphemes).collect();
    if graphemes.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

/// Validates outbound requests and hands them to the live session.
///
/// Never retries: reconnecting is the connection manager's job.
#[derive(Clone)]
pub struct OutboundDispatcher {
    manager: ConnectionManager,
    preview_chars: usize,
    send_timeout: Duration,
}

impl OutboundDispatcher {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_preview_chars(mut self, preview_chars: usize) -> Self {
        self.preview_chars = preview_chars;
        self
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub async fn send(&self, request: SendRequest) -> Result<SendReceipt, DispatchError> {
        let span = info_span!("outbound.send", recipient = Empty, outcome = Empty);
        let started = Instant::now();
        let result = self.send_inner(&request).instrument(span.clone()).await;
        self.audit(&span, &request, &result, started.elapsed());
        result
    }

    /// Like [`OutboundDispatcher::send`] but folds every outcome into a [`SendResult`].
    pub async fn dispatch(&self, request: SendRequest) -> SendResult {
        self.send(request).await.into()
    }

    async fn send_inner(&self, request: &SendRequest) -> Result<SendReceipt, DispatchError> {
        let NormalizedSend { recipient_id, body } = normalize(request)?;
        let lease = self.manager.acquire_session().await?;

        let sent = tokio::time::timeout(self.send_timeout, lease.send(&recipient_id, &body)).await;
        match sent {
            Ok(Ok(provider_message_id)) => Ok(SendReceipt {
                recipient_id,
                provider_message_id,
            }),
            Ok(Err(err)) => Err(DispatchError::Provider(format!("{err:#}"))),
            Err(_) => Err(DispatchError::Provider(format!(
                "send timed out after {}ms",
                self.send_timeout.as_millis()
            ))),
        }
    }

    fn audit(
        &self,
        span: &tracing::Span,
        request: &SendRequest,
        result: &Result<SendReceipt, DispatchError>,
        elapsed: Duration,
    ) {
        let recipient = normalize_recipient(&request.recipient);
        let preview = preview(&request.body, self.preview_chars);
        let at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string());
        let outcome = match result {
            Ok(_) => "delivered",
            Err(err) => err.kind().as_str(),
        };
        with_common_fields(span, Some(&recipient), Some(outcome));

        let _entered = span.enter();
        match result {
            Ok(receipt) => info!(
                recipient = %recipient,
                preview = %preview,
                outcome,
                provider_message_id = %receipt.provider_message_id,
                at = %at,
                "outbound message sent"
            ),
            Err(err) => warn!(
                recipient = %recipient,
                preview = %preview,
                outcome,
                error = %err,
                at = %at,
                "outbound message failed"
            ),
        }

        let labels = TelemetryLabels::new("dispatch").with("outcome", outcome);
        record_counter("outbound_messages_total", 1, &labels);
        record_histogram(
            "outbound_send_latency_ms",
            elapsed.as_secs_f64() * 1000.0,
            &labels,
        );
    }
}

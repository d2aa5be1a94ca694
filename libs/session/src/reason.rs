use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of reasons a session can drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The remote end revoked the session. Never retried.
    LoggedOut,
    Timeout,
    NetworkError,
    ProviderError,
}

impl DisconnectReason {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::LoggedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoggedOut => "logged_out",
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::ProviderError => "provider_error",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw cause as reported by a session provider, before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectCause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DisconnectCause {
    pub fn status(code: u16) -> Self {
        Self {
            status: Some(code),
            reason: None,
        }
    }

    pub fn reason(text: impl Into<String>) -> Self {
        Self {
            status: None,
            reason: Some(text.into()),
        }
    }

    pub fn with_reason(mut self, text: impl Into<String>) -> Self {
        self.reason = Some(text.into());
        self
    }

    pub fn describe(&self) -> String {
        match (self.status, self.reason.as_deref()) {
            (Some(code), Some(text)) => format!("{code} {text}"),
            (Some(code), None) => format!("status {code}"),
            (None, Some(text)) => text.to_string(),
            (None, None) => "unspecified".to_string(),
        }
    }
}

const LOGGED_OUT_TOKENS: &[&str] = &["LOGOUT", "LOGGED_OUT", "UNPAIRED"];
const TIMEOUT_TOKENS: &[&str] = &["TIMEOUT", "TIMED_OUT"];
const NETWORK_TOKENS: &[&str] = &[
    "NAVIGATION",
    "CONNECTION_LOST",
    "CONNECTION_CLOSED",
    "NETWORK",
];
const PROVIDER_TOKENS: &[&str] = &["CONFLICT", "BAD_SESSION", "RESTART_REQUIRED", "PROVIDER"];

/// Maps a provider cause onto [`DisconnectReason`].
///
/// A known status code wins over the text. Anything unrecognised is treated
/// as a network error so the session is retried rather than abandoned.
pub fn classify(cause: &DisconnectCause) -> DisconnectReason {
    if let Some(status) = cause.status {
        match status {
            401 => return DisconnectReason::LoggedOut,
            408 => return DisconnectReason::Timeout,
            428 | 503 => return DisconnectReason::NetworkError,
            411 | 440 | 500 | 515 => return DisconnectReason::ProviderError,
            _ => {}
        }
    }

    let Some(text) = cause.reason.as_deref() else {
        return DisconnectReason::NetworkError;
    };
    let upper = text.trim().to_ascii_uppercase();
    let contains_any = |tokens: &[&str]| tokens.iter().any(|token| upper.contains(token));

    if LOGGED_OUT_TOKENS.contains(&upper.as_str()) {
        DisconnectReason::LoggedOut
    } else if contains_any(TIMEOUT_TOKENS) {
        DisconnectReason::Timeout
    } else if contains_any(NETWORK_TOKENS) {
        DisconnectReason::NetworkError
    } else if contains_any(PROVIDER_TOKENS) {
        DisconnectReason::ProviderError
    } else {
        DisconnectReason::NetworkError
    }
}

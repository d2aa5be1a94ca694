//! Lifecycle core for a paired messaging session.
//!
//! [`ConnectionManager`] owns the one live session: it drives pairing,
//! classifies disconnects, schedules reconnects and hands out the send
//! capability. [`OutboundDispatcher`] validates outbound requests and sends
//! them through whatever session is currently live.

mod backoff;
mod credentials;
mod dispatch;
mod manager;
mod provider;
mod reason;
mod state;
mod status;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use backoff::{BackoffStrategy, ReconnectPolicy};
pub use credentials::{
    CREDENTIALS_FILE, CredentialStore, Credentials, FileCredentialStore, MemoryCredentialStore,
    SharedCredentialStore,
};
pub use dispatch::{
    DEFAULT_PREVIEW_CHARS, DEFAULT_SEND_TIMEOUT, DispatchError, FailureKind, FailureReason,
    MIN_RECIPIENT_DIGITS, NormalizedSend, OutboundDispatcher, PAIRING_PATH, SendReceipt,
    SendRequest, SendResult, ValidationError, normalize, normalize_recipient, preview,
};
pub use manager::{
    ConnectionManager, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PAIRING_TIMEOUT, ManagerOptions,
    PairingView, SessionLease, SessionUnavailable, ShutdownReport,
};
pub use provider::{
    EventSink, SessionEvent, SessionHandle, SessionProvider, SharedSessionHandle,
    SharedSessionProvider,
};
pub use reason::{DisconnectCause, DisconnectReason, classify};
pub use state::{
    ATTEMPTS_EXHAUSTED, AttemptStage, ConnectionState, Effect, PairingCode, Phase, Transition,
    Trigger,
};
pub use status::StatusSnapshot;

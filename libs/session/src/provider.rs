use std::{fmt, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::reason::DisconnectCause;

/// Shared handle to a live session.
pub type SharedSessionHandle = Arc<dyn SessionHandle>;
/// Shared session provider used by the connection manager.
pub type SharedSessionProvider = Arc<dyn SessionProvider>;

/// One authenticated connection. Handles are never reused once closed.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Sends `body` to `recipient_id` and returns the provider message id.
    async fn send(&self, recipient_id: &str, body: &str) -> Result<String>;

    async fn close(&self);
}

/// Opens connections to the messaging network.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Starts one connection attempt.
    ///
    /// Everything that happens to the attempt afterwards (a pairing code, the
    /// live handle, a disconnect) is reported through `events`. An `Err` is
    /// treated like a provider-side disconnect of the attempt.
    async fn connect(&self, events: EventSink) -> Result<()>;
}

pub enum SessionEvent {
    PairingCode(String),
    Connected(SharedSessionHandle),
    Disconnected(DisconnectCause),
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PairingCode(_) => "pairing_code",
            Self::Connected(_) => "connected",
            Self::Disconnected(_) => "disconnected",
        }
    }
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PairingCode(_) => f.write_str("PairingCode(..)"),
            Self::Connected(_) => f.write_str("Connected(..)"),
            Self::Disconnected(cause) => f.debug_tuple("Disconnected").field(cause).finish(),
        }
    }
}

/// Work item for the manager's driver task. Everything that changes the
/// connection state is funnelled through one queue so it is applied in order.
#[derive(Debug)]
pub(crate) enum Signal {
    Event { attempt: u64, event: SessionEvent },
    ConnectFailed { attempt: u64, error: String },
    ReconnectDue { attempt: u32 },
    AttemptExpired { attempt: u64, deadline: u64 },
}

/// Channel back into the connection manager for a single connect attempt.
#[derive(Clone)]
pub struct EventSink {
    attempt: u64,
    tx: mpsc::UnboundedSender<Signal>,
}

impl EventSink {
    pub(crate) fn new(attempt: u64, tx: mpsc::UnboundedSender<Signal>) -> Self {
        Self { attempt, tx }
    }

    /// Generation of the connect attempt this sink belongs to.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Returns `false` once the manager has gone away.
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.tx
            .send(Signal::Event {
                attempt: self.attempt,
                event,
            })
            .is_ok()
    }

    pub fn pairing_code(&self, data: impl Into<String>) -> bool {
        self.emit(SessionEvent::PairingCode(data.into()))
    }

    pub fn connected(&self, handle: SharedSessionHandle) -> bool {
        self.emit(SessionEvent::Connected(handle))
    }

    pub fn disconnected(&self, cause: DisconnectCause) -> bool {
        self.emit(SessionEvent::Disconnected(cause))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

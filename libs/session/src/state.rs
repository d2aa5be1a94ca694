//! Connection lifecycle as an explicit state machine.
//!
//! [`ConnectionState::apply`] is pure bookkeeping: it never performs I/O and
//! never sleeps. Side effects are returned as [`Effect`]s for the manager to
//! carry out after the state lock is released.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    backoff::ReconnectPolicy,
    provider::SharedSessionHandle,
    reason::DisconnectReason,
    status::StatusSnapshot,
};

pub const ATTEMPTS_EXHAUSTED: &str = "reconnect attempts exhausted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Pairing,
    Connected,
    Disconnected,
    ShuttingDown,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pairing => "pairing",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of an attempt a deadline covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStage {
    /// Waiting for the provider to report anything at all.
    Connecting,
    /// Waiting for the current pairing code to be scanned.
    Pairing,
}

impl AttemptStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Pairing => "pairing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingCode {
    pub data: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

pub enum Trigger {
    Start,
    Restart,
    PairingCode {
        attempt: u64,
        data: String,
    },
    Connected {
        attempt: u64,
        handle: SharedSessionHandle,
    },
    Disconnected {
        attempt: u64,
        reason: DisconnectReason,
        detail: String,
    },
    ReconnectDue {
        attempt: u32,
    },
    AttemptExpired {
        attempt: u64,
        deadline: u64,
    },
    Stop,
    Stopped,
}

impl Trigger {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Restart => "restart",
            Self::PairingCode { .. } => "pairing_code",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::ReconnectDue { .. } => "reconnect_due",
            Self::AttemptExpired { .. } => "attempt_expired",
            Self::Stop => "stop",
            Self::Stopped => "stopped",
        }
    }
}

pub enum Effect {
    /// Invoke the provider for attempt generation `attempt`.
    Connect { attempt: u64 },
    /// Start the clock for `stage` of attempt `attempt`. Any earlier deadline
    /// is superseded by this one.
    ArmDeadline {
        attempt: u64,
        deadline: u64,
        stage: AttemptStage,
    },
    ScheduleReconnect {
        delay: Duration,
        attempt: u32,
        reason: DisconnectReason,
    },
    CancelReconnect,
    /// Close right away; the handle is no longer reachable by senders.
    Close(SharedSessionHandle),
    /// Close once in-flight sends have drained.
    Release(SharedSessionHandle),
    Fatal { reason: String },
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { attempt } => f.debug_struct("Connect").field("attempt", attempt).finish(),
            Self::ArmDeadline {
                attempt,
                deadline,
                stage,
            } => f
                .debug_struct("ArmDeadline")
                .field("attempt", attempt)
                .field("deadline", deadline)
                .field("stage", stage)
                .finish(),
            Self::ScheduleReconnect {
                delay,
                attempt,
                reason,
            } => f
                .debug_struct("ScheduleReconnect")
                .field("delay", delay)
                .field("attempt", attempt)
                .field("reason", reason)
                .finish(),
            Self::CancelReconnect => f.write_str("CancelReconnect"),
            Self::Close(_) => f.write_str("Close(..)"),
            Self::Release(_) => f.write_str("Release(..)"),
            Self::Fatal { reason } => f.debug_struct("Fatal").field("reason", reason).finish(),
        }
    }
}

/// Outcome of applying one trigger.
#[derive(Debug)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    /// `false` when the trigger was stale or not valid in the current phase.
    pub applied: bool,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn ignored(phase: Phase) -> Self {
        Self {
            from: phase,
            to: phase,
            applied: false,
            effects: Vec::new(),
        }
    }
}

pub struct ConnectionState {
    phase: Phase,
    pairing_code: Option<PairingCode>,
    last_disconnect_reason: Option<DisconnectReason>,
    last_error: Option<String>,
    reconnect_attempt: u32,
    session: Option<SharedSessionHandle>,
    generation: u64,
    attempt_in_flight: bool,
    deadline: u64,
    reconnect_scheduled: bool,
    stopping: bool,
    connected_since: Option<OffsetDateTime>,
    policy: ReconnectPolicy,
    auto_reconnect: bool,
}

impl ConnectionState {
    pub fn new(policy: ReconnectPolicy, auto_reconnect: bool) -> Self {
        Self {
            phase: Phase::Idle,
            pairing_code: None,
            last_disconnect_reason: None,
            last_error: None,
            reconnect_attempt: 0,
            session: None,
            generation: 0,
            attempt_in_flight: false,
            deadline: 0,
            reconnect_scheduled: false,
            stopping: false,
            connected_since: None,
            policy,
            auto_reconnect,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pairing_code(&self) -> Option<&PairingCode> {
        self.pairing_code.as_ref()
    }

    pub fn last_disconnect_reason(&self) -> Option<DisconnectReason> {
        self.last_disconnect_reason
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn attempt_in_flight(&self) -> bool {
        self.attempt_in_flight
    }

    pub fn reconnect_scheduled(&self) -> bool {
        self.reconnect_scheduled
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// The live handle, only while connected.
    pub fn session(&self) -> Option<&SharedSessionHandle> {
        match self.phase {
            Phase::Connected => self.session.as_ref(),
            _ => None,
        }
    }

    /// Terminal because the remote end logged the session out.
    pub fn is_logged_out(&self) -> bool {
        self.phase == Phase::ShuttingDown
            && !self.stopping
            && self.last_disconnect_reason == Some(DisconnectReason::LoggedOut)
    }

    pub fn snapshot(&self, started_at: OffsetDateTime) -> StatusSnapshot {
        StatusSnapshot {
            phase: self.phase,
            connected: self.phase == Phase::Connected,
            pairing_code_available: self.pairing_code.is_some(),
            last_error: self.last_error.clone(),
            last_disconnect_reason: self.last_disconnect_reason,
            reconnect_attempt: self.reconnect_attempt,
            started_at,
            connected_since: self.connected_since,
            uptime_secs: 0,
        }
    }

    pub fn apply(&mut self, trigger: Trigger) -> Transition {
        let from = self.phase;
        let effects = match trigger {
            Trigger::Start => self.on_start(),
            Trigger::Restart => self.on_restart(),
            Trigger::PairingCode { attempt, data } => self.on_pairing_code(attempt, data),
            Trigger::Connected { attempt, handle } => return self.on_connected(attempt, handle),
            Trigger::Disconnected {
                attempt,
                reason,
                detail,
            } => self.on_disconnected(attempt, reason, detail),
            Trigger::ReconnectDue { attempt } => self.on_reconnect_due(attempt),
            Trigger::AttemptExpired { attempt, deadline } => {
                self.on_attempt_expired(attempt, deadline)
            }
            Trigger::Stop => self.on_stop(),
            Trigger::Stopped => self.on_stopped(),
        };
        match effects {
            Some(effects) => Transition {
                from,
                to: self.phase,
                applied: true,
                effects,
            },
            None => Transition::ignored(from),
        }
    }

    fn begin_attempt(&mut self) -> Vec<Effect> {
        self.generation += 1;
        self.attempt_in_flight = true;
        self.phase = Phase::Idle;
        vec![
            Effect::Connect {
                attempt: self.generation,
            },
            self.arm_deadline(AttemptStage::Connecting),
        ]
    }

    fn arm_deadline(&mut self, stage: AttemptStage) -> Effect {
        self.deadline += 1;
        Effect::ArmDeadline {
            attempt: self.generation,
            deadline: self.deadline,
            stage,
        }
    }

    fn on_start(&mut self) -> Option<Vec<Effect>> {
        let busy = self.attempt_in_flight || self.session.is_some() || self.reconnect_scheduled;
        if self.stopping || self.phase != Phase::Idle || busy {
            return None;
        }
        Some(self.begin_attempt())
    }

    fn on_restart(&mut self) -> Option<Vec<Effect>> {
        if self.stopping {
            return None;
        }
        let mut effects = Vec::new();
        match self.phase {
            Phase::ShuttingDown => {}
            Phase::Disconnected if !self.attempt_in_flight => {
                if self.reconnect_scheduled {
                    self.reconnect_scheduled = false;
                    effects.push(Effect::CancelReconnect);
                }
            }
            Phase::Idle if !self.attempt_in_flight && !self.reconnect_scheduled => {}
            _ => return None,
        }
        self.reconnect_attempt = 0;
        self.last_error = None;
        effects.extend(self.begin_attempt());
        Some(effects)
    }

    fn is_current(&self, attempt: u64) -> bool {
        !self.stopping && attempt == self.generation && self.attempt_in_flight
    }

    fn on_pairing_code(&mut self, attempt: u64, data: String) -> Option<Vec<Effect>> {
        if !self.is_current(attempt) || !matches!(self.phase, Phase::Idle | Phase::Pairing) {
            return None;
        }
        self.phase = Phase::Pairing;
        self.pairing_code = Some(PairingCode {
            data,
            issued_at: OffsetDateTime::now_utc(),
        });
        Some(vec![self.arm_deadline(AttemptStage::Pairing)])
    }

    fn on_connected(&mut self, attempt: u64, handle: SharedSessionHandle) -> Transition {
        let from = self.phase;
        if !self.is_current(attempt) || !matches!(self.phase, Phase::Idle | Phase::Pairing) {
            // a handle from a superseded attempt must never become live
            return Transition {
                from,
                to: from,
                applied: false,
                effects: vec![Effect::Close(handle)],
            };
        }

        let mut effects = Vec::new();
        if let Some(previous) = self.session.replace(handle) {
            effects.push(Effect::Close(previous));
        }
        self.phase = Phase::Connected;
        self.pairing_code = None;
        self.reconnect_attempt = 0;
        self.last_disconnect_reason = None;
        self.last_error = None;
        self.attempt_in_flight = false;
        self.connected_since = Some(OffsetDateTime::now_utc());
        Transition {
            from,
            to: self.phase,
            applied: true,
            effects,
        }
    }

    fn on_disconnected(
        &mut self,
        attempt: u64,
        reason: DisconnectReason,
        detail: String,
    ) -> Option<Vec<Effect>> {
        let live = match self.phase {
            Phase::Connected => true,
            Phase::Idle | Phase::Pairing => self.attempt_in_flight,
            Phase::Disconnected | Phase::ShuttingDown => false,
        };
        if self.stopping || attempt != self.generation || !live {
            return None;
        }

        let mut effects = Vec::new();
        if let Some(handle) = self.session.take() {
            effects.push(Effect::Close(handle));
        }
        self.phase = Phase::Disconnected;
        self.pairing_code = None;
        self.connected_since = None;
        self.attempt_in_flight = false;
        self.last_disconnect_reason = Some(reason);
        self.last_error = Some(format!("{reason}: {detail}"));

        if reason.is_terminal() {
            self.phase = Phase::ShuttingDown;
            effects.push(Effect::Fatal {
                reason: format!("session logged out ({detail}); manual re-pairing required"),
            });
            return Some(effects);
        }
        if !self.auto_reconnect {
            return Some(effects);
        }

        let next = self.reconnect_attempt.saturating_add(1);
        if !self.policy.allows(next) {
            self.phase = Phase::ShuttingDown;
            self.last_error = Some(ATTEMPTS_EXHAUSTED.to_string());
            effects.push(Effect::Fatal {
                reason: ATTEMPTS_EXHAUSTED.to_string(),
            });
            return Some(effects);
        }

        let delay = self.policy.delay(self.reconnect_attempt);
        self.reconnect_attempt = next;
        self.reconnect_scheduled = true;
        effects.push(Effect::ScheduleReconnect {
            delay,
            attempt: next,
            reason,
        });
        Some(effects)
    }

    fn on_reconnect_due(&mut self, attempt: u32) -> Option<Vec<Effect>> {
        let due = self.reconnect_scheduled
            && attempt == self.reconnect_attempt
            && self.phase == Phase::Disconnected;
        if self.stopping || !due {
            return None;
        }
        self.reconnect_scheduled = false;
        Some(self.begin_attempt())
    }

    /// A silent or unscanned attempt is dropped like a timed-out connection.
    fn on_attempt_expired(&mut self, attempt: u64, deadline: u64) -> Option<Vec<Effect>> {
        if !self.is_current(attempt) || deadline != self.deadline {
            return None;
        }
        let detail = match self.phase {
            Phase::Idle => "provider did not respond to the connect attempt",
            Phase::Pairing => "pairing code was not scanned in time",
            _ => return None,
        };
        self.on_disconnected(attempt, DisconnectReason::Timeout, detail.to_string())
    }

    fn on_stop(&mut self) -> Option<Vec<Effect>> {
        if self.stopping {
            return None;
        }
        self.stopping = true;
        // events from the attempt in flight are now stale
        self.generation += 1;
        self.attempt_in_flight = false;
        self.pairing_code = None;
        self.connected_since = None;
        self.phase = Phase::ShuttingDown;

        let mut effects = Vec::new();
        if self.reconnect_scheduled {
            self.reconnect_scheduled = false;
            effects.push(Effect::CancelReconnect);
        }
        if let Some(handle) = self.session.take() {
            effects.push(Effect::Release(handle));
        }
        Some(effects)
    }

    fn on_stopped(&mut self) -> Option<Vec<Effect>> {
        if !self.stopping || self.phase != Phase::ShuttingDown {
            return None;
        }
        self.phase = Phase::Idle;
        Some(Vec::new())
    }
}

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use gsm_telemetry::{TelemetryLabels, record_counter, record_gauge};
use time::OffsetDateTime;
use tokio::{
    sync::{Mutex, Notify, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    backoff::ReconnectPolicy,
    provider::{EventSink, SessionEvent, SharedSessionHandle, SharedSessionProvider, Signal},
    reason::{DisconnectReason, classify},
    state::{AttemptStage, ConnectionState, Effect, PairingCode, Phase, Transition, Trigger},
    status::{StatusPublisher, StatusSnapshot},
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub policy: ReconnectPolicy,
    pub auto_reconnect: bool,
    /// How long an attempt may stay silent before it is treated as a timeout.
    pub connect_timeout: Duration,
    /// How long each pairing code may go unscanned. Re-armed on every new code.
    pub pairing_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            auto_reconnect: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pairing_timeout: DEFAULT_PAIRING_TIMEOUT,
        }
    }
}

impl ManagerOptions {
    fn timeout_for(&self, stage: AttemptStage) -> Duration {
        match stage {
            AttemptStage::Connecting => self.connect_timeout,
            AttemptStage::Pairing => self.pairing_timeout,
        }
    }
}

/// What the pairing endpoint should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingView {
    Connected,
    Pending(PairingCode),
    NotReady,
}

/// Returned by [`ConnectionManager::acquire_session`] outside `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionUnavailable {
    pub phase: Phase,
    pub logged_out: bool,
}

/// Outcome of [`ConnectionManager::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    pub in_flight: usize,
    pub abandoned: usize,
}

/// Owns the single session and every transition of its lifecycle.
///
/// Cloning is cheap; all clones drive the same state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    provider: SharedSessionProvider,
    state: Mutex<ConnectionState>,
    status: StatusPublisher,
    signals: mpsc::UnboundedSender<Signal>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    deadline_timer: Mutex<Option<JoinHandle<()>>>,
    options: ManagerOptions,
    driver: Mutex<Option<JoinHandle<()>>>,
    inflight: InflightTracker,
    started_at: OffsetDateTime,
}

impl ConnectionManager {
    /// Must be called from within a tokio runtime; the event driver is spawned here.
    pub fn new(provider: SharedSessionProvider, options: ManagerOptions) -> Self {
        let started_at = OffsetDateTime::now_utc();
        let state = ConnectionState::new(options.policy.clone(), options.auto_reconnect);
        let status = StatusPublisher::new(state.snapshot(started_at));
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            provider,
            state: Mutex::new(state),
            status,
            signals: tx,
            reconnect_timer: Mutex::new(None),
            deadline_timer: Mutex::new(None),
            options,
            driver: Mutex::new(None),
            inflight: InflightTracker::default(),
            started_at,
        });

        let driver = tokio::spawn(drive(Arc::downgrade(&inner), rx));
        if let Ok(mut slot) = inner.driver.try_lock() {
            *slot = Some(driver);
        }
        Self { inner }
    }

    /// Begins the first connection attempt. Returns `false` when one is
    /// already underway or a session is live.
    pub async fn start(&self) -> bool {
        self.inner.transition(Trigger::Start).await
    }

    /// Manual restart out of a terminal or parked state.
    pub async fn restart(&self) -> bool {
        self.inner.transition(Trigger::Restart).await
    }

    pub fn status(&self) -> StatusSnapshot {
        self.inner.status.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.status.subscribe()
    }

    pub async fn phase(&self) -> Phase {
        self.inner.state.lock().await.phase()
    }

    pub async fn pairing(&self) -> PairingView {
        let state = self.inner.state.lock().await;
        if state.phase() == Phase::Connected {
            return PairingView::Connected;
        }
        match state.pairing_code() {
            Some(code) => PairingView::Pending(code.clone()),
            None => PairingView::NotReady,
        }
    }

    /// Borrows the live handle for one send.
    ///
    /// The lease counts as in flight until dropped, which lets shutdown wait
    /// for it before closing the handle.
    pub async fn acquire_session(&self) -> Result<SessionLease, SessionUnavailable> {
        let state = self.inner.state.lock().await;
        match state.session() {
            Some(handle) => Ok(SessionLease {
                handle: handle.clone(),
                _guard: self.inner.inflight.enter(),
            }),
            None => Err(SessionUnavailable {
                phase: state.phase(),
                logged_out: state.is_logged_out(),
            }),
        }
    }

    /// Stops reconnecting, lets in-flight sends finish for up to `grace`,
    /// then closes the session and parks the manager in its final `Idle`.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let inner = &self.inner;
        let Some(effects) = inner.apply(Trigger::Stop).await else {
            return ShutdownReport::default();
        };
        let releases = inner.run_effects(effects).await;

        let in_flight = inner.inflight.count();
        if in_flight > 0 {
            info!(in_flight, grace_ms = grace.as_millis() as u64, "waiting for in-flight sends");
        }
        let abandoned = if inner.inflight.wait_idle(grace).await {
            0
        } else {
            let abandoned = inner.inflight.count();
            warn!(abandoned, "grace period elapsed with sends still in flight");
            abandoned
        };

        for handle in releases {
            handle.close().await;
        }
        inner.transition(Trigger::Stopped).await;

        if let Some(timer) = inner.deadline_timer.lock().await.take() {
            timer.abort();
        }

        if let Some(driver) = inner.driver.lock().await.take() {
            driver.abort();
        }
        info!(in_flight, abandoned, "connection manager stopped");
        ShutdownReport {
            in_flight,
            abandoned,
        }
    }
}

/// Driver loop: applies queued signals one at a time, in arrival order.
async fn drive(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Signal>) {
    while let Some(signal) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle(signal).await;
    }
    debug!("session event driver stopped");
}

impl Inner {
    async fn handle(&self, signal: Signal) {
        let trigger = match signal {
            Signal::Event { attempt, event } => {
                debug!(attempt, event = event.kind(), "session event");
                match event {
                    SessionEvent::PairingCode(data) => Trigger::PairingCode { attempt, data },
                    SessionEvent::Connected(handle) => Trigger::Connected { attempt, handle },
                    SessionEvent::Disconnected(cause) => Trigger::Disconnected {
                        attempt,
                        reason: classify(&cause),
                        detail: cause.describe(),
                    },
                }
            }
            Signal::ConnectFailed { attempt, error } => Trigger::Disconnected {
                attempt,
                reason: DisconnectReason::ProviderError,
                detail: error,
            },
            Signal::ReconnectDue { attempt } => Trigger::ReconnectDue { attempt },
            Signal::AttemptExpired { attempt, deadline } => Trigger::AttemptExpired { attempt, deadline },
        };
        self.transition(trigger).await;
    }

    /// Applies `trigger` and carries out its effects. Returns whether it applied.
    async fn transition(&self, trigger: Trigger) -> bool {
        match self.apply(trigger).await {
            Some(effects) => {
                self.run_effects(effects).await;
                true
            }
            None => false,
        }
    }

    /// Applies `trigger` under the lock and publishes the new snapshot.
    /// Returns the effects when applied; ignored triggers still get their
    /// cleanup effects run here.
    async fn apply(&self, trigger: Trigger) -> Option<Vec<Effect>> {
        let label = trigger.label();
        let (transition, attempt) = {
            let mut state = self.state.lock().await;
            let transition = state.apply(trigger);
            if transition.applied {
                self.status.publish(state.snapshot(self.started_at));
            }
            (transition, state.reconnect_attempt())
        };
        let Transition {
            from,
            to,
            applied,
            effects,
        } = transition;

        if !applied {
            debug!(phase = %from, trigger = label, "ignoring trigger");
            self.run_effects(effects).await;
            return None;
        }

        info!(from = %from, to = %to, trigger = label, attempt, "session transition");
        if from != to {
            let labels = TelemetryLabels::new("session")
                .with("from", from.as_str())
                .with("to", to.as_str());
            record_counter("session_transitions_total", 1, &labels);
        }
        record_gauge(
            "session_reconnect_attempt",
            f64::from(attempt),
            &TelemetryLabels::new("session"),
        );
        Some(effects)
    }

    /// Runs effects in order. `Release` handles are returned to the caller,
    /// which closes them after draining sends.
    async fn run_effects(&self, effects: Vec<Effect>) -> Vec<SharedSessionHandle> {
        let mut releases = Vec::new();
        for effect in effects {
            match effect {
                Effect::Connect { attempt } => self.spawn_connect(attempt),
                Effect::ArmDeadline {
                    attempt,
                    deadline,
                    stage,
                } => self.arm_deadline(attempt, deadline, stage).await,
                Effect::ScheduleReconnect {
                    delay,
                    attempt,
                    reason,
                } => {
                    info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "reconnect scheduled"
                    );
                    let labels = TelemetryLabels::new("session").with("reason", reason.as_str());
                    record_counter("session_reconnects_scheduled_total", 1, &labels);
                    self.schedule_reconnect(delay, attempt).await;
                }
                Effect::CancelReconnect => {
                    if let Some(timer) = self.reconnect_timer.lock().await.take() {
                        timer.abort();
                        debug!("reconnect timer cancelled");
                    }
                }
                Effect::Close(handle) => {
                    tokio::spawn(async move { handle.close().await });
                }
                Effect::Release(handle) => releases.push(handle),
                Effect::Fatal { reason } => {
                    error!(reason = %reason, "session is terminal; restart required");
                }
            }
        }
        releases
    }

    fn spawn_connect(&self, attempt: u64) {
        let provider = self.provider.clone();
        let tx = self.signals.clone();
        tokio::spawn(async move {
            debug!(attempt, "connecting session");
            let sink = EventSink::new(attempt, tx.clone());
            if let Err(err) = provider.connect(sink).await {
                warn!(attempt, error = %err, "session connect failed");
                let _ = tx.send(Signal::ConnectFailed {
                    attempt,
                    error: format!("{err:#}"),
                });
            }
        });
    }

    async fn arm_deadline(&self, attempt: u64, deadline: u64, stage: AttemptStage) {
        let timeout = self.options.timeout_for(stage);
        let tx = self.signals.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            debug!(attempt, stage = stage.as_str(), "attempt deadline elapsed");
            let _ = tx.send(Signal::AttemptExpired { attempt, deadline });
        });
        if let Some(previous) = self.deadline_timer.lock().await.replace(timer) {
            previous.abort();
        }
    }

    async fn schedule_reconnect(&self, delay: Duration, attempt: u32) {
        let tx = self.signals.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Signal::ReconnectDue { attempt });
        });
        if let Some(previous) = self.reconnect_timer.lock().await.replace(timer) {
            previous.abort();
        }
    }
}

/// A session handle borrowed for one send.
pub struct SessionLease {
    handle: SharedSessionHandle,
    _guard: InflightGuard,
}

impl SessionLease {
    pub fn handle(&self) -> &SharedSessionHandle {
        &self.handle
    }

    pub async fn send(&self, recipient_id: &str, body: &str) -> Result<String> {
        self.handle.send(recipient_id, body).await
    }
}

#[derive(Clone, Default)]
struct InflightTracker {
    shared: Arc<InflightShared>,
}

#[derive(Default)]
struct InflightShared {
    count: AtomicUsize,
    idle: Notify,
}

impl InflightTracker {
    fn enter(&self) -> InflightGuard {
        self.shared.count.fetch_add(1, Ordering::SeqCst);
        InflightGuard {
            shared: self.shared.clone(),
        }
    }

    fn count(&self) -> usize {
        self.shared.count.load(Ordering::SeqCst)
    }

    /// Waits until no sends are in flight. Returns `false` if `grace` elapsed first.
    async fn wait_idle(&self, grace: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.shared.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, wait).await.is_ok()
    }
}

struct InflightGuard {
    shared: Arc<InflightShared>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.shared.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.idle.notify_waiters();
        }
    }
}

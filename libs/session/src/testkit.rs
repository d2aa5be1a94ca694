//! Scriptable providers and handles for exercising the connection manager
//! without a real messaging network.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use crate::{
    manager::ConnectionManager,
    provider::{EventSink, SessionEvent, SessionHandle, SessionProvider, Signal},
    status::StatusSnapshot,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the next `connect()` call does.
pub enum ConnectScript {
    /// Keep the sink and emit nothing; the test drives events.
    Pending,
    Pair(String),
    Connect(Arc<RecordingHandle>),
    Fail(String),
    /// Sleep before failing, to observe overlap.
    FailAfter(Duration, String),
}

/// Records every `connect()` and lets tests emit events on the latest sink.
#[derive(Default)]
pub struct ScriptedProvider {
    sinks: Mutex<Vec<EventSink>>,
    script: Mutex<VecDeque<ConnectScript>>,
    connects: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    connected: Notify,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues the behaviour of upcoming connects; unscripted connects are `Pending`.
    pub fn push(&self, step: ConnectScript) {
        lock(&self.script).push_back(step);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Highest number of `connect()` calls ever running at once.
    pub fn max_concurrent_connects(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn latest_sink(&self) -> Option<EventSink> {
        lock(&self.sinks).last().cloned()
    }

    pub fn sink(&self, index: usize) -> Option<EventSink> {
        lock(&self.sinks).get(index).cloned()
    }

    /// Emits on the most recent attempt. Returns `false` if there is none.
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.latest_sink().is_some_and(|sink| sink.emit(event))
    }

    pub async fn wait_for_connects(&self, count: usize) {
        loop {
            let notified = self.connected.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.connects() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl SessionProvider for ScriptedProvider {
    async fn connect(&self, events: EventSink) -> Result<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        lock(&self.sinks).push(events.clone());
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.notify_waiters();

        let step = lock(&self.script)
            .pop_front()
            .unwrap_or(ConnectScript::Pending);
        let outcome = match step {
            ConnectScript::Pending => Ok(()),
            ConnectScript::Pair(code) => {
                events.pairing_code(code);
                Ok(())
            }
            ConnectScript::Connect(handle) => {
                events.connected(handle);
                Ok(())
            }
            ConnectScript::Fail(message) => Err(anyhow!(message)),
            ConnectScript::FailAfter(delay, message) => {
                tokio::time::sleep(delay).await;
                Err(anyhow!(message))
            }
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Session handle that records what it was asked to do.
#[derive(Default)]
pub struct RecordingHandle {
    sent: Mutex<Vec<(String, String)>>,
    failures: Mutex<VecDeque<String>>,
    latency: Option<Duration>,
    closes: AtomicUsize,
    closed: AtomicBool,
    next_id: AtomicUsize,
}

impl RecordingHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// The next send fails with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        lock(&self.failures).push_back(message.into());
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.sent).clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionHandle for RecordingHandle {
    async fn send(&self, recipient_id: &str, body: &str) -> Result<String> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.is_closed() {
            return Err(anyhow!("session closed"));
        }
        if let Some(message) = lock(&self.failures).pop_front() {
            return Err(anyhow!(message));
        }
        lock(&self.sent).push((recipient_id.to_string(), body.to_string()));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("msg-{id}"))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Receives what a provider emits on a sink that is not wired to a manager.
pub struct RecordedEvents {
    rx: mpsc::UnboundedReceiver<Signal>,
}

impl RecordedEvents {
    pub async fn next(&mut self) -> Option<SessionEvent> {
        while let Some(signal) = self.rx.recv().await {
            if let Signal::Event { event, .. } = signal {
                return Some(event);
            }
        }
        None
    }
}

pub fn recording_sink(attempt: u64) -> (EventSink, RecordedEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink::new(attempt, tx), RecordedEvents { rx })
}

/// Resolves with the first published snapshot that satisfies `predicate`.
pub async fn wait_for_status<F>(manager: &ConnectionManager, predicate: F) -> StatusSnapshot
where
    F: Fn(&StatusSnapshot) -> bool,
{
    let mut rx = manager.subscribe();
    loop {
        {
            let snapshot = rx.borrow_and_update();
            if predicate(&snapshot) {
                return snapshot.clone();
            }
        }
        if rx.changed().await.is_err() {
            return manager.status();
        }
    }
}

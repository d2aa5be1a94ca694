//! Simulated session provider.
//!
//! Issues a pairing code, treats it as scanned after a configurable delay and
//! persists the resulting credentials, so the gateway can be exercised end to
//! end without a real messaging network behind it.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use gsm_session::{
    CredentialStore, Credentials, DisconnectCause, EventSink, SessionHandle, SessionProvider,
    SharedCredentialStore,
};
use serde_json::json;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct DevSessionProvider {
    store: SharedCredentialStore,
    pairing_delay: Duration,
    latest_attempt: Arc<AtomicU64>,
}

impl DevSessionProvider {
    pub fn new(store: SharedCredentialStore, pairing_delay: Duration) -> Self {
        Self {
            store,
            pairing_delay,
            latest_attempt: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// An attempt is abandoned once a newer one starts or the manager stops listening.
fn abandoned(events: &EventSink, latest_attempt: &AtomicU64) -> bool {
    events.is_closed() || latest_attempt.load(Ordering::SeqCst) != events.attempt()
}

fn device_id(credentials: &Credentials) -> Option<String> {
    credentials
        .0
        .get("device_id")
        .and_then(|value| value.as_str())
        .map(str::to_string)
}

/// Returns `None` when the attempt was abandoned before the code was "scanned".
async fn pair(
    store: &dyn CredentialStore,
    events: &EventSink,
    delay: Duration,
    latest_attempt: &AtomicU64,
) -> Result<Option<String>> {
    let code = format!("dev-pair:{}", Uuid::new_v4());
    events.pairing_code(code);
    tokio::time::sleep(delay).await;
    if abandoned(events, latest_attempt) {
        debug!(attempt = events.attempt(), "dev pairing abandoned");
        return Ok(None);
    }

    let device_id = Uuid::new_v4().to_string();
    let paired_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("format pairing timestamp")?;
    let credentials = Credentials(json!({
        "device_id": device_id,
        "paired_at": paired_at,
    }));
    store
        .save(&credentials)
        .await
        .context("persist dev session credentials")?;
    info!(device_id = %device_id, "dev session paired");
    Ok(Some(device_id))
}

#[async_trait]
impl SessionProvider for DevSessionProvider {
    async fn connect(&self, events: EventSink) -> Result<()> {
        let stored = self
            .store
            .load()
            .await
            .context("load dev session credentials")?;
        let known = stored.as_ref().and_then(device_id);
        if stored.is_some() && known.is_none() {
            bail!("stored dev credentials carry no device_id");
        }

        self.latest_attempt.store(events.attempt(), Ordering::SeqCst);
        let store = self.store.clone();
        let delay = self.pairing_delay;
        let latest_attempt = self.latest_attempt.clone();
        tokio::spawn(async move {
            let device_id = match known {
                Some(id) => id,
                None => match pair(store.as_ref(), &events, delay, &latest_attempt).await {
                    Ok(Some(id)) => id,
                    Ok(None) => return,
                    Err(err) => {
                        warn!(error = %err, "dev pairing failed");
                        events.disconnected(DisconnectCause::reason(format!("PROVIDER: {err:#}")));
                        return;
                    }
                },
            };
            if abandoned(&events, &latest_attempt) {
                return;
            }
            debug!(device_id = %device_id, attempt = events.attempt(), "dev session connected");
            events.connected(Arc::new(DevSessionHandle::new(device_id)));
        });
        Ok(())
    }
}

/// Accepts every send and hands back a synthetic message id.
pub struct DevSessionHandle {
    device_id: String,
    closed: AtomicBool,
}

impl DevSessionHandle {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SessionHandle for DevSessionHandle {
    async fn send(&self, recipient_id: &str, _body: &str) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("dev session {} is closed", self.device_id);
        }
        let id = format!("dev:{}", Uuid::new_v4());
        debug!(recipient = %recipient_id, message_id = %id, "dev session accepted message");
        Ok(id)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(device_id = %self.device_id, "dev session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use gsm_session::{MemoryCredentialStore, SessionEvent, testkit::recording_sink};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_connect_pairs_and_persists() {
        let store = Arc::new(MemoryCredentialStore::new());
        let provider = DevSessionProvider::new(store.clone(), Duration::from_secs(3));
        let (sink, mut events) = recording_sink(1);

        provider.connect(sink).await.expect("connect");

        match events.next().await {
            Some(SessionEvent::PairingCode(code)) => assert!(code.starts_with("dev-pair:")),
            other => panic!("expected pairing code, got {other:?}"),
        }
        let handle = match events.next().await {
            Some(SessionEvent::Connected(handle)) => handle,
            other => panic!("expected connected, got {other:?}"),
        };
        let saved = store.load().await.expect("load").expect("credentials saved");
        assert!(device_id(&saved).is_some());

        let id = handle.send("919999999999", "hi").await.expect("send");
        assert!(id.starts_with("dev:"));
        handle.close().await;
        assert!(handle.send("919999999999", "hi").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stored_credentials_skip_pairing() {
        let store = Arc::new(MemoryCredentialStore::with_credentials(Credentials(
            json!({"device_id": "known-device"}),
        )));
        let provider = DevSessionProvider::new(store, Duration::from_secs(3));
        let (sink, mut events) = recording_sink(7);

        provider.connect(sink).await.expect("connect");
        assert!(matches!(events.next().await, Some(SessionEvent::Connected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_manager_leaves_store_untouched() {
        let store = Arc::new(MemoryCredentialStore::new());
        let provider = DevSessionProvider::new(store.clone(), Duration::from_secs(3));
        let (sink, mut events) = recording_sink(1);

        provider.connect(sink).await.expect("connect");
        assert!(matches!(events.next().await, Some(SessionEvent::PairingCode(_))));
        drop(events);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(store.load().await.expect("load").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_attempt_never_connects() {
        let store = Arc::new(MemoryCredentialStore::new());
        let provider = DevSessionProvider::new(store.clone(), Duration::from_secs(3));
        let (first, mut first_events) = recording_sink(1);
        provider.connect(first).await.expect("connect");
        assert!(matches!(first_events.next().await, Some(SessionEvent::PairingCode(_))));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let (second, mut second_events) = recording_sink(2);
        provider.connect(second).await.expect("connect");

        // the first task gives up and drops its sink without emitting
        assert!(first_events.next().await.is_none());
        assert!(matches!(second_events.next().await, Some(SessionEvent::PairingCode(_))));
        assert!(matches!(second_events.next().await, Some(SessionEvent::Connected(_))));
        assert!(store.load().await.expect("load").is_some());
    }

    #[tokio::test]
    async fn malformed_credentials_fail_the_attempt() {
        let store = Arc::new(MemoryCredentialStore::with_credentials(Credentials(
            json!({"token": "no device"}),
        )));
        let provider = DevSessionProvider::new(store, Duration::from_secs(3));
        let (sink, _events) = recording_sink(1);
        assert!(provider.connect(sink).await.is_err());
    }
}

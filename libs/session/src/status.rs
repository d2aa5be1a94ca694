use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::{reason::DisconnectReason, state::Phase};

/// Read-only view of the connection published after every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub connected: bool,
    pub pairing_code_available: bool,
    pub last_error: Option<String>,
    pub last_disconnect_reason: Option<DisconnectReason>,
    pub reconnect_attempt: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub connected_since: Option<OffsetDateTime>,
    pub uptime_secs: u64,
}

impl StatusSnapshot {
    fn at(mut self, now: OffsetDateTime) -> Self {
        self.uptime_secs = (now - self.started_at).whole_seconds().max(0) as u64;
        self
    }
}

/// Whole snapshots are swapped in at once, so readers never see a torn value.
pub(crate) struct StatusPublisher {
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusPublisher {
    pub(crate) fn new(initial: StatusSnapshot) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub(crate) fn publish(&self, snapshot: StatusSnapshot) {
        self.tx.send_replace(snapshot);
    }

    pub(crate) fn current(&self) -> StatusSnapshot {
        self.tx.borrow().clone().at(OffsetDateTime::now_utc())
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;

    fn snapshot(started_at: OffsetDateTime) -> StatusSnapshot {
        StatusSnapshot {
            phase: Phase::Idle,
            connected: false,
            pairing_code_available: false,
            last_error: None,
            last_disconnect_reason: None,
            reconnect_attempt: 0,
            started_at,
            connected_since: None,
            uptime_secs: 0,
        }
    }

    #[test]
    fn uptime_is_computed_on_read() {
        let started = OffsetDateTime::now_utc() - Duration::seconds(90);
        let publisher = StatusPublisher::new(snapshot(started));
        assert!(publisher.current().uptime_secs >= 90);
    }

    #[test]
    fn publish_reaches_subscribers() {
        let publisher = StatusPublisher::new(snapshot(OffsetDateTime::now_utc()));
        let mut rx = publisher.subscribe();

        let mut next = snapshot(OffsetDateTime::now_utc());
        next.phase = Phase::Pairing;
        next.pairing_code_available = true;
        publisher.publish(next);

        assert!(rx.has_changed().unwrap_or(false));
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.phase, Phase::Pairing);
        assert!(seen.pairing_code_available);
    }

    #[test]
    fn serializes_timestamps_as_rfc3339() {
        let started = OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("timestamp");
        let json = serde_json::to_value(snapshot(started)).expect("json");
        assert_eq!(json["phase"], "idle");
        assert_eq!(json["started_at"], "2023-11-14T22:13:20Z");
        assert!(json["connected_since"].is_null());
    }
}

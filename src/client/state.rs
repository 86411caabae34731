//! Observable client state

use crate::telemetry::LastTelemetry;
use serde::Serialize;

/// Connection lifecycle as seen by the client core. `Idle` means disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Delivery counters. Only the client core can advance them and none can go down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Counters {
    sent: u64,
    sent_ok: u64,
    sent_failed: u64,
    received: u64,
}

impl Counters {
    /// Publishes issued
    pub fn messages_sent(&self) -> u64 {
        self.sent
    }

    /// Publishes acknowledged by the broker
    pub fn messages_sent_ok(&self) -> u64 {
        self.sent_ok
    }

    /// Publishes the session refused to queue
    pub fn messages_sent_failed(&self) -> u64 {
        self.sent_failed
    }

    /// Packets received from the broker, of any kind
    pub fn messages_received(&self) -> u64 {
        self.received
    }

    pub(crate) fn record_sent(&mut self) {
        self.sent = self.sent.saturating_add(1);
    }

    pub(crate) fn record_sent_ok(&mut self) {
        self.sent_ok = self.sent_ok.saturating_add(1);
    }

    pub(crate) fn record_sent_failed(&mut self) {
        self.sent_failed = self.sent_failed.saturating_add(1);
    }

    pub(crate) fn record_received(&mut self) {
        self.received = self.received.saturating_add(1);
    }

    /// True when no counter in `self` is below its value in `earlier`
    pub fn dominates(&self, earlier: &Counters) -> bool {
        self.sent >= earlier.sent
            && self.sent_ok >= earlier.sent_ok
            && self.sent_failed >= earlier.sent_failed
            && self.received >= earlier.received
    }
}

/// Consistent view of the client, replaced as a whole on every committed change
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientSnapshot {
    pub state: ConnectionState,
    pub is_connected: bool,
    pub is_sending_telemetry: bool,
    pub counters: Counters,
    pub last_telemetry: Option<LastTelemetry>,
    pub last_error: Option<String>,
}

impl ClientSnapshot {
    /// Last published message, or an empty string before the first tick
    pub fn last_telemetry_message(&self) -> &str {
        self.last_telemetry
            .as_ref()
            .map(|last| last.message.as_str())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_snapshot_is_idle() {
        let snapshot = ClientSnapshot::default();
        assert_eq!(snapshot.state, ConnectionState::Idle);
        assert!(!snapshot.is_connected);
        assert!(!snapshot.is_sending_telemetry);
        assert_eq!(snapshot.counters, Counters::default());
        assert_eq!(snapshot.last_telemetry_message(), "");
    }

    #[test]
    fn test_counters_only_increase() {
        let before = Counters::default();
        let mut after = before;
        after.record_sent();
        after.record_sent_failed();
        after.record_received();
        after.record_sent_ok();

        assert_eq!(after.messages_sent(), 1);
        assert_eq!(after.messages_sent_ok(), 1);
        assert_eq!(after.messages_sent_failed(), 1);
        assert_eq!(after.messages_received(), 1);
        assert!(after.dominates(&before));
        assert!(!before.dominates(&after));
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionState::Disconnecting).unwrap();
        assert_eq!(json, "\"disconnecting\"");
    }
}

//! Transport layer for broker communication
//!
//! This module provides the session abstraction the client core drives, the
//! notification values a session emits, and the rumqttc-backed implementation.

pub mod mqtt;

pub use rumqttc::QoS;

/// Map a configured QoS level to the protocol value
pub fn qos_from_level(level: u8) -> Result<QoS, crate::config::ConfigError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(crate::config::ConfigError::InvalidConfig(format!(
            "QoS level {other} is not valid"
        ))),
    }
}

/// One encrypted connection to a broker endpoint
///
/// Every call is non-blocking: it queues the request and returns. Outcomes arrive
/// later as [`SessionEvent`]s on the session's notification channel, delivered on
/// whatever task the I/O layer runs on. A synchronous `Err` means the request could
/// not be queued at all.
pub trait TransportSession: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the connection handshake
    fn connect(&self) -> Result<(), Self::Error>;

    /// Queue a publish; fire-and-forget at this layer
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool)
        -> Result<(), Self::Error>;

    /// Start a graceful shutdown. `StateChanged(Disconnected)` follows once the link is closed.
    fn disconnect(&self) -> Result<(), Self::Error>;
}

/// Link state as reported by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

/// Kind of a packet received from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    ConnAck,
    Publish,
    PubAck,
    SubAck,
    UnsubAck,
    PingResp,
    Disconnect,
    Other,
}

/// Packet received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub kind: PacketKind,
    pub topic: Option<String>,
    pub payload: Vec<u8>,
}

impl InboundPacket {
    pub fn new(kind: PacketKind) -> Self {
        Self {
            kind,
            topic: None,
            payload: Vec::new(),
        }
    }

    pub fn publish(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: PacketKind::Publish,
            topic: Some(topic.into()),
            payload: payload.into(),
        }
    }
}

/// Notifications delivered by a session, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionAcknowledged,
    StateChanged(LinkState),
    PacketReceived(InboundPacket),
    TransportError(String),
}

/// Receiving end of a session's notification channel
pub type SessionEvents = tokio::sync::mpsc::UnboundedReceiver<SessionEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_level() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1).unwrap(), QoS::AtLeastOnce);
        assert!(qos_from_level(3).is_err());
    }

    #[test]
    fn test_publish_packet_constructor() {
        let packet = InboundPacket::publish("devices/a/messages/devicebound/", b"hi".to_vec());
        assert_eq!(packet.kind, PacketKind::Publish);
        assert_eq!(packet.topic.as_deref(), Some("devices/a/messages/devicebound/"));
        assert_eq!(packet.payload, b"hi");
    }

    #[test]
    fn test_control_packet_has_no_topic() {
        let packet = InboundPacket::new(PacketKind::PingResp);
        assert!(packet.topic.is_none());
        assert!(packet.payload.is_empty());
    }
}

//! Pure routing of rumqttc events into session notifications
//!
//! The session loop polls rumqttc and hands each event here. The result says which
//! notifications to emit and whether the loop should keep polling.

use crate::transport::{InboundPacket, LinkState, PacketKind, SessionEvent};
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to a handling decision (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(Packet::ConnAck(connack)) if connack.code != ConnectReturnCode::Success => {
                EventRoute::Refused(format!("{:?}", connack.code))
            }
            Event::Incoming(packet) => EventRoute::Inbound(Self::classify_packet(packet)),
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::LocalDisconnect,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Convert an incoming packet into the transport-neutral form (pure function)
    pub fn classify_packet(packet: &Packet) -> InboundPacket {
        match packet {
            Packet::Publish(publish) => {
                InboundPacket::publish(publish.topic.clone(), publish.payload.to_vec())
            }
            Packet::ConnAck(_) => InboundPacket::new(PacketKind::ConnAck),
            Packet::PubAck(_) => InboundPacket::new(PacketKind::PubAck),
            Packet::SubAck(_) => InboundPacket::new(PacketKind::SubAck),
            Packet::UnsubAck(_) => InboundPacket::new(PacketKind::UnsubAck),
            Packet::PingResp => InboundPacket::new(PacketKind::PingResp),
            Packet::Disconnect => InboundPacket::new(PacketKind::Disconnect),
            _ => InboundPacket::new(PacketKind::Other),
        }
    }

    /// Notifications to emit for a route, and whether polling continues
    ///
    /// `close_expected` is true once the broker accepted the connection or a disconnect was
    /// requested. Before that, a failed attempt ends with `TransportError` alone so a retry
    /// is never followed by a late `Disconnected` from the attempt it replaced.
    pub fn notifications_for(
        route: EventRoute,
        close_expected: bool,
    ) -> (Vec<SessionEvent>, LoopControl) {
        match route {
            EventRoute::Inbound(packet) => {
                (vec![SessionEvent::PacketReceived(packet)], LoopControl::Continue)
            }
            EventRoute::Refused(code) => (
                Self::terminal(format!("Broker refused connection: {code}"), close_expected),
                LoopControl::Stop,
            ),
            EventRoute::LocalDisconnect => (
                vec![SessionEvent::StateChanged(LinkState::Disconnected)],
                LoopControl::Stop,
            ),
            EventRoute::OutgoingEvent => (Vec::new(), LoopControl::Continue),
        }
    }

    /// Notifications to emit when polling fails. The link is gone after this.
    pub fn notifications_for_error(error: &str, close_expected: bool) -> Vec<SessionEvent> {
        Self::terminal(error.to_string(), close_expected)
    }

    /// Whether a route carries the broker's acceptance of the connection
    pub fn is_acknowledgment(route: &EventRoute) -> bool {
        matches!(route, EventRoute::Inbound(packet) if packet.kind == PacketKind::ConnAck)
    }

    fn terminal(error: String, close_expected: bool) -> Vec<SessionEvent> {
        let mut events = vec![SessionEvent::TransportError(error)];
        if close_expected {
            events.push(SessionEvent::StateChanged(LinkState::Disconnected));
        }
        events
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Packet from the broker, forwarded to the core
    Inbound(InboundPacket),
    /// Broker answered CONNECT with a failure code
    Refused(String),
    /// Our DISCONNECT has been written; the link is closing
    LocalDisconnect,
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

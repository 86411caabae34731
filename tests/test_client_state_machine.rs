//! Client state machine tests
//!
//! Drive the client through commands and session notifications and check the
//! observable snapshot and the calls made against the session.


use hub_telemetry::client::ConnectionState;
use hub_telemetry::error::ClientError;
use hub_telemetry::testing::SessionCall;
use hub_telemetry::transport::{InboundPacket, LinkState, PacketKind, SessionEvent};
use std::time::Duration;
use test_helpers::{connected_client, test_client};

const INTERVAL: Duration = Duration::from_secs(5);

#[test]
fn test_connect_then_acknowledgment_reaches_connected() {
    // Arrange
    let (client, _) = test_client();

    // Act
    client.connect().unwrap();
    client.handle_event(SessionEvent::ConnectionAcknowledged);

    // Assert
    let snapshot = client.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert!(snapshot.is_connected);
    assert_eq!(client.session().calls(), vec![SessionCall::Connect]);
}

#[test]
fn test_link_state_connected_also_reaches_connected() {
    let (client, _) = test_client();

    client.connect().unwrap();
    client.handle_event(SessionEvent::StateChanged(LinkState::Connecting));
    assert_eq!(client.snapshot().state, ConnectionState::Connecting);

    client.handle_event(SessionEvent::StateChanged(LinkState::Connected));
    assert!(client.snapshot().is_connected);
}

#[test]
fn test_tick_publishes_reading_to_device_topic() {
    // Arrange
    let (client, scheduler) = connected_client();
    client.start_telemetry(INTERVAL).unwrap();

    // Act
    scheduler.advance(INTERVAL);

    // Assert
    let snapshot = client.snapshot();
    assert_eq!(snapshot.counters.messages_sent(), 1);

    let publishes = client.session().publishes();
    assert_eq!(publishes.len(), 1);
    assert_eq!(publishes[0].topic, "devices/sensor-01/messages/events/");

    let payload = publishes[0].payload_json();
    assert!(payload.get("temperature").is_some());
    assert!(payload.get("humidity").is_some());
    assert_eq!(snapshot.last_telemetry_message(), publishes[0].payload_str());
}

#[test]
fn test_unexpected_disconnect_stops_telemetry() {
    // Arrange
    let (client, scheduler) = connected_client();
    client.start_telemetry(INTERVAL).unwrap();
    scheduler.advance(INTERVAL);
    assert_eq!(client.session().publishes().len(), 1);

    // Act
    client.handle_event(SessionEvent::StateChanged(LinkState::Disconnected));
    scheduler.advance(INTERVAL * 4);

    // Assert
    let snapshot = client.snapshot();
    assert!(!snapshot.is_sending_telemetry);
    assert_eq!(snapshot.state, ConnectionState::Idle);
    assert_eq!(client.session().publishes().len(), 1);
    assert_eq!(scheduler.active_schedules(), 0);
}

#[test]
fn test_transport_error_while_connecting_returns_to_idle() {
    // Arrange
    let (client, _) = test_client();
    client.connect().unwrap();

    // Act
    client.handle_event(SessionEvent::TransportError(
        "connection refused".to_string(),
    ));

    // Assert
    let snapshot = client.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Idle);
    assert!(!snapshot.is_connected);
    assert!(snapshot
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("connection refused")));
}

#[test]
fn test_connect_can_be_retried_after_failure() {
    let (client, _) = test_client();
    client.connect().unwrap();
    client.handle_event(SessionEvent::TransportError("timeout".to_string()));

    client.connect().unwrap();
    client.handle_event(SessionEvent::ConnectionAcknowledged);

    let snapshot = client.snapshot();
    assert!(snapshot.is_connected);
    assert!(snapshot.last_error.is_none());
    assert_eq!(client.session().connect_calls(), 2);
}

#[test]
fn test_graceful_disconnect_cycle() {
    // Arrange
    let (client, scheduler) = connected_client();
    client.start_telemetry(INTERVAL).unwrap();

    // Act
    client.disconnect().unwrap();

    // Assert: telemetry is gone before the request is issued
    assert!(!client.snapshot().is_sending_telemetry);
    assert_eq!(scheduler.active_schedules(), 0);
    assert_eq!(client.snapshot().state, ConnectionState::Disconnecting);
    assert_eq!(client.session().disconnect_calls(), 1);

    client.handle_event(SessionEvent::StateChanged(LinkState::Disconnected));
    assert_eq!(client.snapshot().state, ConnectionState::Idle);
}

#[test]
fn test_every_command_is_defined_in_every_state() {
    // Each reachable state paired with each command, with the resulting state
    let cases: Vec<(ConnectionState, &str, Option<ConnectionState>)> = vec![
        (ConnectionState::Idle, "connect", Some(ConnectionState::Connecting)),
        (ConnectionState::Idle, "disconnect", None),
        (ConnectionState::Idle, "start", None),
        (ConnectionState::Idle, "stop", Some(ConnectionState::Idle)),
        (ConnectionState::Connecting, "connect", None),
        (ConnectionState::Connecting, "disconnect", Some(ConnectionState::Disconnecting)),
        (ConnectionState::Connecting, "start", None),
        (ConnectionState::Connecting, "stop", Some(ConnectionState::Connecting)),
        (ConnectionState::Connected, "connect", None),
        (ConnectionState::Connected, "disconnect", Some(ConnectionState::Disconnecting)),
        (ConnectionState::Connected, "start", Some(ConnectionState::Connected)),
        (ConnectionState::Connected, "stop", Some(ConnectionState::Connected)),
        (ConnectionState::Disconnecting, "connect", None),
        (ConnectionState::Disconnecting, "disconnect", None),
        (ConnectionState::Disconnecting, "start", None),
        (ConnectionState::Disconnecting, "stop", Some(ConnectionState::Disconnecting)),
    ];

    for (from, command, expected) in cases {
        let (client, _) = test_client();
        match from {
            ConnectionState::Idle => {}
            ConnectionState::Connecting => client.connect().unwrap(),
            ConnectionState::Connected => {
                client.connect().unwrap();
                client.handle_event(SessionEvent::ConnectionAcknowledged);
            }
            ConnectionState::Disconnecting => {
                client.connect().unwrap();
                client.handle_event(SessionEvent::ConnectionAcknowledged);
                client.disconnect().unwrap();
            }
        }
        assert_eq!(client.snapshot().state, from);

        let result = match command {
            "connect" => client.connect(),
            "disconnect" => client.disconnect(),
            "start" => client.start_telemetry(INTERVAL),
            "stop" => {
                client.stop_telemetry();
                Ok(())
            }
            other => unreachable!("unknown command {other}"),
        };

        match expected {
            Some(next) => {
                assert!(result.is_ok(), "{command} from {from:?} should succeed");
                assert_eq!(client.snapshot().state, next, "{command} from {from:?}");
            }
            None => {
                assert!(
                    matches!(result, Err(ClientError::InvalidState { .. })),
                    "{command} from {from:?} should be rejected"
                );
                assert_eq!(client.snapshot().state, from, "rejected {command} changed state");
            }
        }
    }
}

#[test]
fn test_second_start_keeps_single_schedule() {
    // Arrange
    let (client, scheduler) = connected_client();

    // Act
    client.start_telemetry(INTERVAL).unwrap();
    client.start_telemetry(Duration::from_secs(1)).unwrap();

    // Assert
    assert_eq!(scheduler.active_schedules(), 1);
    scheduler.advance(INTERVAL);
    assert_eq!(client.session().publishes().len(), 1);
}

#[test]
fn test_stop_is_idempotent() {
    let (client, scheduler) = connected_client();
    client.start_telemetry(INTERVAL).unwrap();

    client.stop_telemetry();
    client.stop_telemetry();

    assert!(!client.snapshot().is_sending_telemetry);
    assert_eq!(scheduler.active_schedules(), 0);
}

#[test]
fn test_no_tick_publishes_after_stop() {
    let (client, scheduler) = connected_client();
    client.start_telemetry(INTERVAL).unwrap();
    scheduler.advance(INTERVAL * 2);

    client.stop_telemetry();
    let sent = client.snapshot().counters.messages_sent();
    scheduler.advance(INTERVAL * 10);

    assert_eq!(sent, 2);
    assert_eq!(client.snapshot().counters.messages_sent(), sent);
    assert_eq!(client.session().publishes().len(), 2);
}

#[test]
fn test_restart_after_stop_uses_fresh_schedule() {
    let (client, scheduler) = connected_client();
    client.start_telemetry(INTERVAL).unwrap();
    client.stop_telemetry();

    client.start_telemetry(INTERVAL).unwrap();
    scheduler.advance(INTERVAL);

    assert_eq!(scheduler.active_schedules(), 1);
    assert_eq!(client.session().publishes().len(), 1);
}

#[test]
fn test_every_packet_counts_as_received() {
    let (client, _) = connected_client();
    let packets = [
        InboundPacket::new(PacketKind::PingResp),
        InboundPacket::new(PacketKind::SubAck),
        InboundPacket::publish("devices/sensor-01/messages/devicebound/", b"reboot".to_vec()),
        InboundPacket::new(PacketKind::Other),
    ];

    for packet in packets {
        client.handle_event(SessionEvent::PacketReceived(packet));
    }

    let counters = client.snapshot().counters;
    assert_eq!(counters.messages_received(), 4);
    assert_eq!(counters.messages_sent_ok(), 0);
}

#[tokio::test]
async fn test_event_pump_applies_notifications_in_order() {
    // Arrange
    let (session, events) = hub_telemetry::testing::MockSession::acknowledging();
    let scheduler = std::sync::Arc::new(hub_telemetry::testing::ManualScheduler::new());
    let client = hub_telemetry::TelemetryClient::new(
        &test_helpers::test_config(),
        session,
        scheduler,
    )
    .unwrap();
    let pump = client.attach_events(events);

    // Act
    client.connect().unwrap();
    client
        .wait_for_connection(Duration::from_secs(1))
        .await
        .unwrap();
    client.disconnect().unwrap();

    // Assert
    client
        .wait_for_state(ConnectionState::Idle, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(
        client.session().calls(),
        vec![SessionCall::Connect, SessionCall::Disconnect]
    );

    drop(client);
    pump.abort();
}

#[tokio::test]
async fn test_retry_survives_late_closure_of_failed_attempt() {
    // Arrange: session notifications flow through the pump like the real I/O layer
    let (session, events) = hub_telemetry::testing::MockSession::with_events();
    let scheduler = std::sync::Arc::new(hub_telemetry::testing::ManualScheduler::new());
    let client = hub_telemetry::TelemetryClient::new(
        &test_helpers::test_config(),
        session,
        scheduler,
    )
    .unwrap();
    let pump = client.attach_events(events);

    client.connect().unwrap();
    client
        .session()
        .emit(SessionEvent::TransportError("connection refused".to_string()));
    let err = client
        .wait_for_connection(Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Connect failed: connection refused");

    // Act: retry, then the failed attempt's closure and the retry's ack arrive
    client.connect().unwrap();
    client
        .session()
        .emit(SessionEvent::StateChanged(LinkState::Disconnected));
    client.session().emit(SessionEvent::ConnectionAcknowledged);

    // Assert
    client
        .wait_for_connection(Duration::from_secs(1))
        .await
        .unwrap();
    assert!(client.snapshot().is_connected);

    drop(client);
    pump.abort();
}

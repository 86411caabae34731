//! Impure I/O for the MQTT session
//!
//! Owns the rumqttc client handle and the task that polls its event loop. Every
//! public call only queues work; results come back on the notification channel.

use super::connection::{configure_mqtt_options, MqttError, REQUEST_CHANNEL_CAPACITY};
use super::message_handler::{LoopControl, MessageHandler};
use crate::config::{ClientConfig, Credentials, TrustMaterial};
use crate::error::{sanitize_error_message, ClientError, ClientResult};
use crate::transport::{LinkState, QoS, SessionEvent, SessionEvents, TransportSession};
use rumqttc::{AsyncClient, EventLoop, MqttOptions};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// rumqttc-backed transport session for one device
pub struct MqttSession {
    device_id: String,
    options: MqttOptions,
    runtime: Handle,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    current_attempt: Arc<AtomicU64>,
    link: Mutex<Link>,
}

#[derive(Default)]
struct Link {
    client: Option<AsyncClient>,
    event_loop_handle: Option<JoinHandle<()>>,
    closing: Option<Arc<AtomicBool>>,
}

/// Notification sender bound to one `connect` attempt
///
/// Events from an attempt that has since been replaced or abandoned are dropped.
struct AttemptNotifier {
    attempt: u64,
    current: Arc<AtomicU64>,
    closing: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl AttemptNotifier {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.attempt
    }

    /// Whether a disconnect was requested for this attempt
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Returns false when the attempt is superseded or nobody is listening
    fn send(&self, event: SessionEvent) -> bool {
        self.is_current() && self.tx.send(event).is_ok()
    }
}

impl Link {
    fn is_running(&self) -> bool {
        self.event_loop_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl MqttSession {
    /// Build an unconnected session and its notification channel
    ///
    /// Fails with [`ClientError::Configuration`] when the broker needs TLS and the
    /// trust material is missing or malformed, or when called outside a tokio runtime.
    pub fn configure(
        config: &ClientConfig,
        credentials: &Credentials,
        trust: Option<&TrustMaterial>,
    ) -> ClientResult<(Self, SessionEvents)> {
        let options = configure_mqtt_options(config, credentials, trust).map_err(|e| match e {
            MqttError::Configuration(config_error) => ClientError::Configuration(config_error),
            other => ClientError::Transport(Box::new(other)),
        })?;

        let runtime = Handle::try_current().map_err(|_| {
            ClientError::configuration("MQTT session must be configured inside a tokio runtime")
        })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let session = Self {
            device_id: config.device.id.clone(),
            options,
            runtime,
            events_tx,
            current_attempt: Arc::new(AtomicU64::new(0)),
            link: Mutex::new(Link::default()),
        };

        Ok((session, events_rx))
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Invalidate every event the running attempt has not sent yet
    fn supersede_attempt(&self) -> u64 {
        self.current_attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, event: SessionEvent) {
        if self.events_tx.send(event).is_err() {
            debug!(device_id = %self.device_id, "Notification dropped, no consumer attached");
        }
    }

    /// Whether the event loop task is still polling
    pub fn is_running(&self) -> bool {
        self.lock_link().is_running()
    }
}

/// Poll the rumqttc event loop until the link closes
async fn run_event_loop(device_id: String, mut event_loop: EventLoop, notifier: AttemptNotifier) {
    info!(device_id = %device_id, attempt = notifier.attempt, "Starting MQTT event loop");
    notifier.send(SessionEvent::StateChanged(LinkState::Connecting));

    let mut acknowledged = false;

    loop {
        match event_loop.poll().await {
            Ok(event) => {
                let route = MessageHandler::route_mqtt_event(&event);
                acknowledged |= MessageHandler::is_acknowledgment(&route);
                let close_expected = acknowledged || notifier.is_closing();

                let (notifications, control) =
                    MessageHandler::notifications_for(route, close_expected);
                for notification in notifications {
                    if !notifier.send(notification) {
                        warn!(device_id = %device_id, "Attempt superseded or consumer gone, stopping event loop");
                        return;
                    }
                }
                if control == LoopControl::Stop {
                    break;
                }
            }
            Err(e) => {
                let message = sanitize_error_message(&e.to_string());
                error!(device_id = %device_id, error = %message, "MQTT event loop error");
                let close_expected = acknowledged || notifier.is_closing();
                for notification in MessageHandler::notifications_for_error(&message, close_expected)
                {
                    notifier.send(notification);
                }
                break;
            }
        }
    }

    info!(device_id = %device_id, "MQTT event loop stopped");
}

impl TransportSession for MqttSession {
    type Error = MqttError;

    fn connect(&self) -> Result<(), Self::Error> {
        let mut link = self.lock_link();
        if link.is_running() {
            return Err(MqttError::AlreadyRunning);
        }

        // Fresh client and event loop per attempt so a failed handshake can be retried
        let (client, event_loop) = AsyncClient::new(self.options.clone(), REQUEST_CHANNEL_CAPACITY);
        let closing = Arc::new(AtomicBool::new(false));
        let notifier = AttemptNotifier {
            attempt: self.supersede_attempt(),
            current: Arc::clone(&self.current_attempt),
            closing: Arc::clone(&closing),
            tx: self.events_tx.clone(),
        };
        let handle = self
            .runtime
            .spawn(run_event_loop(self.device_id.clone(), event_loop, notifier));

        link.client = Some(client);
        link.event_loop_handle = Some(handle);
        link.closing = Some(closing);
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error> {
        let link = self.lock_link();
        let client = link.client.as_ref().ok_or(MqttError::NotConnected)?;
        client
            .try_publish(topic, qos, retain, payload)
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    fn disconnect(&self) -> Result<(), Self::Error> {
        let mut link = self.lock_link();

        if link.is_running() {
            if let Some(closing) = &link.closing {
                closing.store(true, Ordering::SeqCst);
            }
            if let Some(client) = &link.client {
                match client.try_disconnect() {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(device_id = %self.device_id, error = %e, "Could not queue DISCONNECT, closing link");
                    }
                }
            }
            if let Some(handle) = link.event_loop_handle.take() {
                handle.abort();
            }
        }

        // Anything the abandoned loop still had in flight must not follow our notification
        self.supersede_attempt();
        link.client = None;
        link.closing = None;
        drop(link);

        // The loop is gone, so nobody else will report the closed link
        self.notify(SessionEvent::StateChanged(LinkState::Disconnected));
        Ok(())
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        // Abort the event loop task if it's still running
        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = link.event_loop_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_configure_plaintext_session() {
        let config = ClientConfig::test_config();
        let credentials = config.credentials().unwrap();
        let (session, _events) = MqttSession::configure(&config, &credentials, None).unwrap();
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_configure_tls_without_trust_fails() {
        let mut config = ClientConfig::test_config();
        config.broker.url = "mqtts://hub.example.net".to_string();
        let credentials = config.credentials().unwrap();

        let result = MqttSession::configure(&config, &credentials, None);
        assert!(matches!(result, Err(ClientError::Configuration(_))));
    }

    #[test]
    fn test_configure_outside_runtime_fails() {
        let config = ClientConfig::test_config();
        let credentials = config.credentials().unwrap();
        let result = MqttSession::configure(&config, &credentials, None);
        assert!(matches!(result, Err(ClientError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let config = ClientConfig::test_config();
        let credentials = config.credentials().unwrap();
        let (session, _events) = MqttSession::configure(&config, &credentials, None).unwrap();

        let result = session.publish(
            "devices/test-device/messages/events/",
            b"{}".to_vec(),
            QoS::AtMostOnce,
            false,
        );
        assert!(matches!(result, Err(MqttError::NotConnected)));
    }

    fn notifier_for(
        attempt: u64,
        current: &Arc<AtomicU64>,
        tx: &mpsc::UnboundedSender<SessionEvent>,
    ) -> AttemptNotifier {
        AttemptNotifier {
            attempt,
            current: Arc::clone(current),
            closing: Arc::new(AtomicBool::new(false)),
            tx: tx.clone(),
        }
    }

    #[tokio::test]
    async fn test_superseded_attempt_events_are_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let current = Arc::new(AtomicU64::new(1));
        let first = notifier_for(1, &current, &tx);

        assert!(first.send(SessionEvent::TransportError("refused".to_string())));

        // A retry replaces the first attempt before its trailing events go out
        current.store(2, Ordering::SeqCst);
        let second = notifier_for(2, &current, &tx);
        assert!(!first.send(SessionEvent::StateChanged(LinkState::Disconnected)));
        assert!(second.send(SessionEvent::ConnectionAcknowledged));

        drop(tx);
        drop(first);
        drop(second);
        let mut received = Vec::new();
        while let Some(event) = rx.recv().await {
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                SessionEvent::TransportError("refused".to_string()),
                SessionEvent::ConnectionAcknowledged,
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_starts_new_attempt() {
        let config = ClientConfig::test_config();
        let credentials = config.credentials().unwrap();
        let (session, _events) = MqttSession::configure(&config, &credentials, None).unwrap();

        session.connect().unwrap();
        assert_eq!(session.current_attempt.load(Ordering::SeqCst), 1);
        assert!(session.lock_link().closing.is_some());
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_reports_disconnected() {
        let config = ClientConfig::test_config();
        let credentials = config.credentials().unwrap();
        let (session, mut events) = MqttSession::configure(&config, &credentials, None).unwrap();

        assert!(session.disconnect().is_ok());
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::StateChanged(LinkState::Disconnected))
        );
    }
}

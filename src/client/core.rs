//! Telemetry client core
//!
//! Three entry points mutate client state: commands from the owner, notifications from the
//! transport session, and ticks from the scheduler. All of them go through one mutex, and the
//! observer snapshot is replaced before that mutex is released.

use super::scheduler::{Scheduler, TickFn, TickHandle};
use super::state::{ClientSnapshot, ConnectionState, Counters};
use crate::config::{telemetry_topic, ClientConfig};
use crate::error::{sanitize_error_message, ClientError, ClientResult};
use crate::telemetry::{LastTelemetry, TelemetryGenerator};
use crate::transport::{
    qos_from_level, InboundPacket, LinkState, PacketKind, QoS, SessionEvent, SessionEvents,
    TransportSession,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Client for one device and one broker connection
pub struct TelemetryClient<S: TransportSession> {
    inner: Arc<ClientInner<S>>,
}

struct ClientInner<S> {
    device_id: String,
    topic: String,
    qos: QoS,
    session: S,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<CoreState>,
    snapshot_tx: watch::Sender<ClientSnapshot>,
}

struct CoreState {
    connection: ConnectionState,
    telemetry: Option<TelemetrySession>,
    next_generation: u64,
    counters: Counters,
    last_telemetry: Option<LastTelemetry>,
    last_error: Option<String>,
    generator: TelemetryGenerator,
}

/// The active publish loop. Ticks from an older generation are ignored.
struct TelemetrySession {
    generation: u64,
    interval: Duration,
    tick: TickHandle,
}

impl CoreState {
    fn new(generator: TelemetryGenerator) -> Self {
        Self {
            connection: ConnectionState::Idle,
            telemetry: None,
            next_generation: 0,
            counters: Counters::default(),
            last_telemetry: None,
            last_error: None,
            generator,
        }
    }

    fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            state: self.connection,
            is_connected: self.connection.is_connected(),
            is_sending_telemetry: self.telemetry.is_some(),
            counters: self.counters,
            last_telemetry: self.last_telemetry.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

impl<S: TransportSession> TelemetryClient<S> {
    /// Create a client around an unconnected session
    ///
    /// Fails with [`ClientError::Configuration`] when the configuration does not validate.
    pub fn new(
        config: &ClientConfig,
        session: S,
        scheduler: Arc<dyn Scheduler>,
    ) -> ClientResult<Self> {
        config.validate()?;
        let qos = qos_from_level(config.telemetry.qos)?;

        let (snapshot_tx, _) = watch::channel(ClientSnapshot::default());

        let inner = ClientInner {
            device_id: config.device.id.clone(),
            topic: telemetry_topic(&config.device.id),
            qos,
            session,
            scheduler,
            state: Mutex::new(CoreState::new(TelemetryGenerator::new())),
            snapshot_tx,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Replace the reading source, e.g. with a seeded one
    pub fn with_generator(self, generator: TelemetryGenerator) -> Self {
        self.inner.lock().generator = generator;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Topic every telemetry message is published to
    pub fn telemetry_topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn session(&self) -> &S {
        &self.inner.session
    }

    /// Start connecting. Valid only while idle.
    ///
    /// Returns once the handshake has been requested; the outcome arrives as a session event.
    pub fn connect(&self) -> ClientResult<()> {
        let inner = &self.inner;
        let _span = crate::session_span!(device_id = %inner.device_id, operation = "connect").entered();
        let mut state = inner.lock();

        if state.connection != ConnectionState::Idle {
            return Err(ClientError::invalid_state("connect", state.connection));
        }

        inner.transition(&mut state, ConnectionState::Connecting);
        state.last_error = None;

        if let Err(e) = inner.session.connect() {
            let message = sanitize_error_message(&e.to_string());
            warn!(device_id = %inner.device_id, error = %message, "Connect request failed");
            inner.transition(&mut state, ConnectionState::Idle);
            state.last_error = Some(message.clone());
            inner.commit(&state);
            return Err(ClientError::connect(message));
        }

        inner.commit(&state);
        Ok(())
    }

    /// Stop telemetry, then start a graceful disconnect
    ///
    /// Valid while connecting or connected. The client stays in `Disconnecting` until the session
    /// reports the link closed.
    pub fn disconnect(&self) -> ClientResult<()> {
        let inner = &self.inner;
        let _span =
            crate::session_span!(device_id = %inner.device_id, operation = "disconnect").entered();
        let mut state = inner.lock();

        match state.connection {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            other => return Err(ClientError::invalid_state("disconnect", other)),
        }

        inner.stop_telemetry_locked(&mut state);
        inner.transition(&mut state, ConnectionState::Disconnecting);

        let result = match inner.session.disconnect() {
            Ok(()) => Ok(()),
            Err(e) => {
                // Nothing was queued, so no Disconnected notification will follow
                let message = sanitize_error_message(&e.to_string());
                warn!(device_id = %inner.device_id, error = %message, "Disconnect request failed, dropping link state");
                inner.transition(&mut state, ConnectionState::Idle);
                state.last_error = Some(message);
                Err(ClientError::Transport(Box::new(e)))
            }
        };

        inner.commit(&state);
        result
    }

    /// Begin publishing a reading every `interval`
    ///
    /// Valid only while connected. Calling it again while telemetry is running keeps the
    /// existing schedule.
    pub fn start_telemetry(&self, interval: Duration) -> ClientResult<()> {
        if interval.is_zero() {
            return Err(ClientError::configuration(
                "Telemetry interval must be greater than zero",
            ));
        }

        let inner = &self.inner;
        let mut state = inner.lock();

        if state.connection != ConnectionState::Connected {
            return Err(ClientError::invalid_state("start telemetry", state.connection));
        }

        if let Some(active) = &state.telemetry {
            debug!(
                device_id = %inner.device_id,
                interval_ms = active.interval.as_millis() as u64,
                "Telemetry already active, keeping existing schedule"
            );
            return Ok(());
        }

        let generation = state.next_generation;
        state.next_generation += 1;

        let weak: Weak<ClientInner<S>> = Arc::downgrade(&self.inner);
        let tick: TickFn = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.publish_tick(generation);
            }
        });
        let handle = inner.scheduler.schedule_repeating(interval, tick);

        state.telemetry = Some(TelemetrySession {
            generation,
            interval,
            tick: handle,
        });
        info!(
            device_id = %inner.device_id,
            interval_ms = interval.as_millis() as u64,
            topic = %inner.topic,
            "Telemetry started"
        );

        inner.commit(&state);
        Ok(())
    }

    /// Cancel the publish loop. Always valid; no tick publishes after this returns.
    pub fn stop_telemetry(&self) {
        let mut state = self.inner.lock();
        if self.inner.stop_telemetry_locked(&mut state) {
            self.inner.commit(&state);
        }
    }

    /// Apply one session notification
    pub fn handle_event(&self, event: SessionEvent) {
        self.inner.handle_event(event);
    }

    /// Feed session notifications to this client, in arrival order, on a background task
    ///
    /// The task ends when the session closes its channel or the client is dropped.
    pub fn attach_events(&self, mut events: SessionEvents) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let device_id = self.inner.device_id.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_event(event);
            }
            debug!(device_id = %device_id, "Session event pump stopped");
        })
    }

    /// Current committed state
    pub fn snapshot(&self) -> ClientSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Change notifications; each received value is a complete snapshot
    pub fn subscribe(&self) -> watch::Receiver<ClientSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Wait until the client reaches `target`
    pub async fn wait_for_state(
        &self,
        target: ConnectionState,
        timeout: Duration,
    ) -> ClientResult<()> {
        let mut rx = self.subscribe();
        let started = Instant::now();

        let reached = tokio::time::timeout(timeout, async {
            loop {
                if rx.borrow_and_update().state == target {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;

        match reached {
            Ok(true) => Ok(()),
            _ => Err(ClientError::Timeout {
                target,
                waited_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// Wait for a pending `connect` to resolve
    ///
    /// Fails fast with [`ClientError::Connect`] when the attempt ends back in `Idle`.
    pub async fn wait_for_connection(&self, timeout: Duration) -> ClientResult<()> {
        let mut rx = self.subscribe();
        let started = Instant::now();

        let outcome = tokio::time::timeout(timeout, async {
            loop {
                {
                    let snapshot = rx.borrow_and_update();
                    match snapshot.state {
                        ConnectionState::Connected => return Ok(()),
                        ConnectionState::Connecting => {}
                        other => {
                            let reason = snapshot
                                .last_error
                                .clone()
                                .unwrap_or_else(|| format!("connection ended in {other:?}"));
                            return Err(ClientError::connect(reason));
                        }
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(ClientError::connect("client dropped"));
                }
            }
        })
        .await;

        outcome.unwrap_or_else(|_| {
            Err(ClientError::Timeout {
                target: ConnectionState::Connected,
                waited_ms: started.elapsed().as_millis() as u64,
            })
        })
    }
}

impl<S: TransportSession> ClientInner<S> {
    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the snapshot for `state`. Called with the lock held.
    fn commit(&self, state: &CoreState) {
        let next = state.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn transition(&self, state: &mut CoreState, next: ConnectionState) {
        if state.connection != next {
            info!(
                device_id = %self.device_id,
                from = ?state.connection,
                to = ?next,
                "Connection state changed"
            );
            state.connection = next;
        }
    }

    /// Returns whether a schedule was cancelled
    fn stop_telemetry_locked(&self, state: &mut CoreState) -> bool {
        match state.telemetry.take() {
            Some(active) => {
                active.tick.cancel();
                info!(device_id = %self.device_id, generation = active.generation, "Telemetry stopped");
                true
            }
            None => false,
        }
    }

    fn on_acknowledged(&self, state: &mut CoreState) {
        match state.connection {
            ConnectionState::Connecting => {
                self.transition(state, ConnectionState::Connected);
                state.last_error = None;
            }
            other => debug!(device_id = %self.device_id, state = ?other, "Ignoring connection acknowledgment"),
        }
    }

    fn on_packet(&self, state: &mut CoreState, packet: InboundPacket) {
        state.counters.record_received();
        match packet.kind {
            PacketKind::ConnAck => self.on_acknowledged(state),
            PacketKind::PubAck => state.counters.record_sent_ok(),
            PacketKind::Publish => debug!(
                device_id = %self.device_id,
                topic = packet.topic.as_deref().unwrap_or_default(),
                bytes = packet.payload.len(),
                "Message received"
            ),
            _ => {}
        }
    }

    fn handle_event(&self, event: SessionEvent) {
        let _span = crate::session_span!(device_id = %self.device_id, operation = "event").entered();
        let mut state = self.lock();

        match event {
            SessionEvent::ConnectionAcknowledged
            | SessionEvent::StateChanged(LinkState::Connected) => {
                self.on_acknowledged(&mut state);
            }
            SessionEvent::StateChanged(LinkState::Connecting) => {
                debug!(device_id = %self.device_id, "Session is connecting");
            }
            SessionEvent::StateChanged(LinkState::Disconnected) => match state.connection {
                // A failed attempt ends with TransportError, so this belongs to an earlier one
                ConnectionState::Connecting => {
                    debug!(device_id = %self.device_id, "Ignoring link closure while connecting");
                }
                ConnectionState::Connected => {
                    warn!(device_id = %self.device_id, "Link closed unexpectedly");
                    self.stop_telemetry_locked(&mut state);
                    self.transition(&mut state, ConnectionState::Idle);
                }
                ConnectionState::Disconnecting | ConnectionState::Idle => {
                    self.stop_telemetry_locked(&mut state);
                    self.transition(&mut state, ConnectionState::Idle);
                }
            },
            SessionEvent::PacketReceived(packet) => self.on_packet(&mut state, packet),
            SessionEvent::TransportError(message) => {
                let message = sanitize_error_message(&message);
                if state.connection == ConnectionState::Connecting {
                    warn!(device_id = %self.device_id, error = %message, "Connection attempt failed");
                    self.transition(&mut state, ConnectionState::Idle);
                    state.last_error = Some(message);
                } else {
                    warn!(device_id = %self.device_id, state = ?state.connection, error = %message, "Transport error");
                    state.last_error = Some(format!("Transport error: {message}"));
                }
            }
        }

        self.commit(&state);
    }

    /// One tick of the publish loop
    fn publish_tick(&self, generation: u64) {
        let _span = crate::telemetry_span!(device_id = %self.device_id, generation).entered();
        let mut state = self.lock();

        let current = state
            .telemetry
            .as_ref()
            .is_some_and(|active| active.generation == generation);
        if !current {
            debug!(device_id = %self.device_id, "Stale tick ignored");
            return;
        }

        if state.connection != ConnectionState::Connected {
            warn!(device_id = %self.device_id, state = ?state.connection, "Tick while not connected, stopping telemetry");
            self.stop_telemetry_locked(&mut state);
            self.commit(&state);
            return;
        }

        let sample = state.generator.generate();
        let message = match sample.to_payload() {
            Ok(message) => message,
            Err(e) => {
                warn!(device_id = %self.device_id, error = %e, "Could not serialize telemetry");
                return;
            }
        };

        state.last_telemetry = Some(LastTelemetry {
            sample,
            message: message.clone(),
            generated_at: chrono::Utc::now(),
        });
        state.counters.record_sent();

        match self
            .session
            .publish(&self.topic, message.into_bytes(), self.qos, false)
        {
            Ok(()) => debug!(
                device_id = %self.device_id,
                sent = state.counters.messages_sent(),
                "Telemetry published"
            ),
            Err(e) => {
                let error = ClientError::publish(sanitize_error_message(&e.to_string()));
                warn!(device_id = %self.device_id, error = %error, "Telemetry publish failed");
                state.counters.record_sent_failed();
                state.last_error = Some(error.to_string());
            }
        }

        self.commit(&state);
    }
}

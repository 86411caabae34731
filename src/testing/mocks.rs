//! Mock implementations for testing
//!
//! Provides a recording transport session and a manually advanced scheduler so the
//! client core can be driven without a broker or real timers.

use crate::client::scheduler::{Scheduler, TickFn, TickHandle};
use crate::transport::{QoS, SessionEvent, SessionEvents, TransportSession};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error returned by [`MockSession`] when a failure toggle is set
#[derive(Debug, Error)]
#[error("mock session {0} failure")]
pub struct MockSessionError(&'static str);

/// A publish recorded by [`MockSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or_default()
    }

    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// Calls made against a [`MockSession`], in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Connect,
    Publish(PublishedMessage),
    Disconnect,
}

/// Transport session that records calls instead of touching the network
#[derive(Debug, Default)]
pub struct MockSession {
    calls: Mutex<Vec<SessionCall>>,
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    fail_disconnect: AtomicBool,
    auto_acknowledge: AtomicBool,
    events_tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock with a notification channel, for driving the client through `attach_events`
    pub fn with_events() -> (Self, SessionEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            events_tx: Some(tx),
            ..Default::default()
        };
        (session, rx)
    }

    /// Answer `connect` with an immediate acknowledgment and `disconnect` with a closed link
    pub fn acknowledging() -> (Self, SessionEvents) {
        let (session, rx) = Self::with_events();
        session.auto_acknowledge.store(true, Ordering::SeqCst);
        (session, rx)
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    /// Push a notification as if it came from the I/O layer
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.events_tx
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.lock_calls().clone()
    }

    pub fn publishes(&self) -> Vec<PublishedMessage> {
        self.lock_calls()
            .iter()
            .filter_map(|call| match call {
                SessionCall::Publish(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn connect_calls(&self) -> usize {
        self.count(|call| matches!(call, SessionCall::Connect))
    }

    pub fn disconnect_calls(&self) -> usize {
        self.count(|call| matches!(call, SessionCall::Disconnect))
    }

    pub fn clear_history(&self) {
        self.lock_calls().clear();
    }

    fn count(&self, predicate: impl Fn(&SessionCall) -> bool) -> usize {
        self.lock_calls().iter().filter(|call| predicate(call)).count()
    }

    fn lock_calls(&self) -> MutexGuard<'_, Vec<SessionCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn auto_emit(&self, event: SessionEvent) {
        if self.auto_acknowledge.load(Ordering::SeqCst) {
            self.emit(event);
        }
    }
}

impl TransportSession for MockSession {
    type Error = MockSessionError;

    fn connect(&self) -> Result<(), Self::Error> {
        self.lock_calls().push(SessionCall::Connect);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(MockSessionError("connect"));
        }
        self.auto_emit(SessionEvent::ConnectionAcknowledged);
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error> {
        self.lock_calls().push(SessionCall::Publish(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        }));
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(MockSessionError("publish"));
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), Self::Error> {
        self.lock_calls().push(SessionCall::Disconnect);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(MockSessionError("disconnect"));
        }
        self.auto_emit(SessionEvent::StateChanged(
            crate::transport::LinkState::Disconnected,
        ));
        Ok(())
    }
}

/// Scheduler driven by explicit calls to [`ManualScheduler::advance`]
#[derive(Default)]
pub struct ManualScheduler {
    clock: Mutex<ManualClock>,
}

#[derive(Default)]
struct ManualClock {
    now: Duration,
    entries: Vec<ScheduledTick>,
}

struct ScheduledTick {
    interval: Duration,
    next_due: Duration,
    tick: TickFn,
    cancelled: Arc<AtomicBool>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated time elapsed since creation
    pub fn now(&self) -> Duration {
        self.lock_clock().now
    }

    /// Schedules that have not been cancelled
    pub fn active_schedules(&self) -> usize {
        let mut clock = self.lock_clock();
        clock.entries.retain(|entry| !entry.cancelled.load(Ordering::SeqCst));
        clock.entries.len()
    }

    /// Move simulated time forward, firing every tick that falls due in time order
    ///
    /// Ticks run without the scheduler lock held, so a tick may cancel its own schedule.
    pub fn advance(&self, by: Duration) {
        let target = self.lock_clock().now + by;

        loop {
            let due = {
                let mut guard = self.lock_clock();
                let clock = &mut *guard;
                clock.entries.retain(|entry| !entry.cancelled.load(Ordering::SeqCst));

                let next = clock
                    .entries
                    .iter_mut()
                    .filter(|entry| entry.next_due <= target)
                    .min_by_key(|entry| entry.next_due);

                match next {
                    Some(entry) => {
                        let fire_at = entry.next_due;
                        entry.next_due += entry.interval;
                        let fired = (Arc::clone(&entry.tick), Arc::clone(&entry.cancelled));
                        clock.now = fire_at;
                        Some(fired)
                    }
                    None => {
                        clock.now = target;
                        None
                    }
                }
            };

            match due {
                Some((tick, cancelled)) => {
                    if !cancelled.load(Ordering::SeqCst) {
                        tick();
                    }
                }
                None => break,
            }
        }
    }

    fn lock_clock(&self) -> MutexGuard<'_, ManualClock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_repeating(&self, interval: Duration, tick: TickFn) -> TickHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut clock = self.lock_clock();
        let next_due = clock.now + interval;
        clock.entries.push(ScheduledTick {
            interval,
            next_due,
            tick,
            cancelled: Arc::clone(&cancelled),
        });

        TickHandle::new(move || cancelled.store(true, Ordering::SeqCst))
    }
}

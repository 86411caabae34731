//! Recurring tick scheduling
//!
//! The core never owns a timer itself; it asks a [`Scheduler`] for a repeating tick and keeps
//! the returned [`TickHandle`]. Dropping or cancelling the handle ends the schedule.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Callback invoked on every tick
pub type TickFn = Arc<dyn Fn() + Send + Sync>;

/// Source of recurring ticks
pub trait Scheduler: Send + Sync {
    /// Call `tick` every `interval`, first one `interval` from now
    fn schedule_repeating(&self, interval: Duration, tick: TickFn) -> TickHandle;
}

/// Ownership of one repeating schedule
pub struct TickHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TickHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop the schedule. No tick starts after this returns.
    pub fn cancel(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TickHandle {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for TickHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Scheduler backed by tokio timers
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    runtime: Handle,
}

impl TokioScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Scheduler on the runtime of the calling task
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_repeating(&self, interval: Duration, tick: TickFn) -> TickHandle {
        let task = self.runtime.spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval completes immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                tick();
            }
        });

        TickHandle::new(move || {
            debug!("Cancelling repeating tick");
            task.abort();
        })
    }
}

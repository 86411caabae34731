//! Telemetry client core
//!
//! - [`core`] - The connection state machine and publish loop
//! - [`state`] - Snapshot types exposed to observers
//! - [`scheduler`] - Recurring tick abstraction and its tokio implementation

pub mod core;
pub mod scheduler;
pub mod state;

pub use self::core::TelemetryClient;
pub use scheduler::{Scheduler, TickFn, TickHandle, TokioScheduler};
pub use state::{ClientSnapshot, ConnectionState, Counters};

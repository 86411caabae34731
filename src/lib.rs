//! Hub Telemetry - device telemetry client
//!
//! Connects one device to a cloud MQTT broker over TLS, publishes simulated sensor readings
//! on a fixed interval, and exposes connection state and delivery counters to observers.
//!
//! # Overview
//!
//! - [`client`] - Connection state machine, publish loop and observer snapshots
//! - [`transport`] - Session abstraction and the rumqttc-backed implementation
//! - [`telemetry`] - Simulated temperature and humidity readings
//! - [`config`] - TOML device configuration, credentials and trust material
//! - [`observability`] - Structured logging
//!
//! # Quick Start
//!
//! ```rust
//! use hub_telemetry::client::{ConnectionState, TelemetryClient};
//! use hub_telemetry::config::ClientConfig;
//! use hub_telemetry::testing::{ManualScheduler, MockSession};
//! use hub_telemetry::transport::SessionEvent;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = ClientConfig::from_toml_str(
//!     r#"
//!     [device]
//!     id = "sensor-01"
//!
//!     [broker]
//!     url = "mqtt://localhost:1883"
//!     "#,
//! )?;
//!
//! let scheduler = Arc::new(ManualScheduler::new());
//! let client = TelemetryClient::new(&config, MockSession::new(), scheduler.clone())?;
//!
//! client.connect()?;
//! client.handle_event(SessionEvent::ConnectionAcknowledged);
//! assert_eq!(client.snapshot().state, ConnectionState::Connected);
//!
//! client.start_telemetry(config.telemetry_interval())?;
//! scheduler.advance(Duration::from_secs(5));
//! assert_eq!(client.snapshot().counters.messages_sent(), 1);
//! # Ok::<(), hub_telemetry::ClientError>(())
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use client::{ClientSnapshot, ConnectionState, Counters, TelemetryClient};
pub use config::{ClientConfig, ConfigError};
pub use error::{ClientError, ClientResult};
pub use telemetry::{TelemetryGenerator, TelemetrySample};
pub use transport::mqtt::MqttSession;

//! MQTT transport session backed by rumqttc
//!
//! Split the same way as the rest of the transport code: pure functions apart from I/O.
//!
//! - [`connection`] - Pure option building from configuration and trust material
//! - [`message_handler`] - Pure routing of rumqttc events into session notifications
//! - [`session`] - Impure I/O: the client handle and the event loop task
//!
//! # Usage
//!
//! ```rust,no_run
//! use hub_telemetry::config::ClientConfig;
//! use hub_telemetry::transport::mqtt::MqttSession;
//! use hub_telemetry::transport::TransportSession;
//!
//! # tokio_test::block_on(async {
//! let config = ClientConfig::load_from_file("device.toml".as_ref())?;
//! let credentials = config.credentials()?;
//! let trust = config.load_trust_material()?;
//!
//! let (session, mut events) = MqttSession::configure(&config, &credentials, trust.as_ref())?;
//! session.connect()?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod connection;
pub mod message_handler;
pub mod session;

// Re-export public types for convenience
pub use connection::{configure_mqtt_options, MqttError};
pub use message_handler::{EventRoute, LoopControl, MessageHandler};
pub use session::MqttSession;

//! Pure connection configuration for the MQTT session
//!
//! Builds rumqttc options from the device configuration and trust material.
//! Nothing here touches the network.

use crate::config::{ClientConfig, ConfigError, Credentials, TrustMaterial};
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use std::time::Duration;
use thiserror::Error;

/// Capacity of the rumqttc request channel between client handle and event loop
pub const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// MQTT session errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Session not connected")]
    NotConnected,
    #[error("Event loop already running")]
    AlreadyRunning,
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigError),
}

/// Build rumqttc options for the configured broker
///
/// TLS is used whenever the broker URL is `mqtts`; in that case trust material is
/// mandatory and is validated before it is handed to the TLS layer.
pub fn configure_mqtt_options(
    config: &ClientConfig,
    credentials: &Credentials,
    trust: Option<&TrustMaterial>,
) -> Result<MqttOptions, MqttError> {
    let endpoint = config.endpoint()?;

    let mut mqtt_options = MqttOptions::new(config.device.id.clone(), endpoint.host, endpoint.port);

    if endpoint.use_tls {
        let trust = trust.ok_or_else(|| {
            ConfigError::TrustMaterial("TLS broker requires a CA certificate".to_string())
        })?;
        trust.validate()?;
        mqtt_options.set_transport(RumqttcTransport::tls(
            trust.ca_cert.clone(),
            trust.client_auth.clone(),
            None,
        ));
    } else {
        tracing::warn!(
            broker = %config.broker.url,
            "Broker URL is plaintext; credentials will be sent unencrypted"
        );
    }

    mqtt_options.set_credentials(credentials.username.clone(), credentials.password.clone());
    mqtt_options.set_keep_alive(Duration::from_secs(config.broker.keep_alive_secs));
    mqtt_options.set_clean_session(config.broker.clean_session);

    Ok(mqtt_options)
}

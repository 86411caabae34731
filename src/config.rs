//! Device configuration loaded from TOML
//!
//! The configuration is read once at startup and never mutated afterward. Secrets are
//! not stored in the file: the broker password is resolved from an environment
//! variable at runtime, and TLS material is referenced by path and loaded on demand.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default telemetry publish interval in seconds
pub const DEFAULT_TELEMETRY_INTERVAL_SECS: u64 = 5;

/// Default IoT hub MQTT API version used to build the broker username
pub const DEFAULT_API_VERSION: &str = "2021-04-12";

const MQTTS_DEFAULT_PORT: u16 = 8883;
const MQTT_DEFAULT_PORT: u16 = 1883;
const PEM_CERTIFICATE_HEADER: &str = "-----BEGIN CERTIFICATE-----";

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub device: DeviceSection,
    pub broker: BrokerSection,
    pub tls: Option<TlsSection>,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier, also used as the MQTT client id
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL, `mqtts://host[:port]` or `mqtt://host[:port]`
    pub url: String,
    /// Explicit username; derived from host, device id and api version when absent
    pub username: Option<String>,
    /// Environment variable holding the access credential (e.g. a SAS token)
    pub password_env: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
}

/// Paths to PEM encoded trust material
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    pub ca_cert: PathBuf,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// 0 = at most once (fire-and-forget), 1 = at least once
    #[serde(default)]
    pub qos: u8,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_TELEMETRY_INTERVAL_SECS,
            qos: 0,
        }
    }
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_clean_session() -> bool {
    true
}

fn default_interval() -> u64 {
    DEFAULT_TELEMETRY_INTERVAL_SECS
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid trust material: {0}")]
    TrustMaterial(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Parsed broker address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Username/password pair presented to the broker. Opaque to the client.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// PEM bytes for the broker CA and the optional client certificate/key pair
#[derive(Clone)]
pub struct TrustMaterial {
    pub ca_cert: Vec<u8>,
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl std::fmt::Debug for TrustMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustMaterial")
            .field("ca_cert_len", &self.ca_cert.len())
            .field("client_auth", &self.client_auth.is_some())
            .finish()
    }
}

impl TrustMaterial {
    /// Check the material looks usable without parsing it
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ca_cert.is_empty() {
            return Err(ConfigError::TrustMaterial("CA certificate is empty".to_string()));
        }
        if !contains_pem_certificate(&self.ca_cert) {
            return Err(ConfigError::TrustMaterial(
                "CA certificate is not PEM encoded".to_string(),
            ));
        }
        if let Some((cert, key)) = &self.client_auth {
            if !contains_pem_certificate(cert) {
                return Err(ConfigError::TrustMaterial(
                    "client certificate is not PEM encoded".to_string(),
                ));
            }
            if key.is_empty() {
                return Err(ConfigError::TrustMaterial("client key is empty".to_string()));
            }
        }
        Ok(())
    }
}

fn contains_pem_certificate(bytes: &[u8]) -> bool {
    String::from_utf8_lossy(bytes).contains(PEM_CERTIFICATE_HEADER)
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id)?;
        let endpoint = self.endpoint()?;

        if endpoint.use_tls && self.tls.is_none() {
            return Err(ConfigError::InvalidConfig(
                "mqtts broker requires a [tls] section with ca_cert".to_string(),
            ));
        }

        if let Some(tls) = &self.tls {
            if tls.client_cert.is_some() != tls.client_key.is_some() {
                return Err(ConfigError::InvalidConfig(
                    "tls.client_cert and tls.client_key must be set together".to_string(),
                ));
            }
        }

        if self.telemetry.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "telemetry.interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.telemetry.qos > 1 {
            return Err(ConfigError::InvalidConfig(format!(
                "telemetry.qos must be 0 or 1, got {}",
                self.telemetry.qos
            )));
        }

        if self.broker.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.keep_alive_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse the broker URL into host, port and TLS flag
    pub fn endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        let url = Url::parse(&self.broker.url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(self.broker.url.clone()))?;

        let use_tls = match url.scheme() {
            "mqtts" | "ssl" => true,
            "mqtt" | "tcp" => false,
            _ => return Err(ConfigError::InvalidBrokerUrl(self.broker.url.clone())),
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(self.broker.url.clone()))?
            .to_string();

        let port = url.port().unwrap_or(if use_tls {
            MQTTS_DEFAULT_PORT
        } else {
            MQTT_DEFAULT_PORT
        });

        Ok(BrokerEndpoint {
            host,
            port,
            use_tls,
        })
    }

    /// Device scoped telemetry topic: `devices/{device_id}/messages/events/`
    pub fn telemetry_topic(&self) -> String {
        telemetry_topic(&self.device.id)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.interval_secs)
    }

    /// Resolve broker credentials. A missing password variable yields an empty password.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let username = match &self.broker.username {
            Some(username) => username.clone(),
            None => {
                let endpoint = self.endpoint()?;
                format!(
                    "{}/{}/?api-version={}",
                    endpoint.host, self.device.id, self.broker.api_version
                )
            }
        };

        let password = self
            .broker
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default();

        Ok(Credentials { username, password })
    }

    /// Read the PEM files named in `[tls]`. Returns `None` when no `[tls]` section exists.
    pub fn load_trust_material(&self) -> Result<Option<TrustMaterial>, ConfigError> {
        let Some(tls) = &self.tls else {
            return Ok(None);
        };

        let ca_cert = read_pem(&tls.ca_cert)?;
        let client_auth = match (&tls.client_cert, &tls.client_key) {
            (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
            _ => None,
        };

        let material = TrustMaterial {
            ca_cert,
            client_auth,
        };
        material.validate()?;
        Ok(Some(material))
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "test-device"

[broker]
url = "mqtt://localhost:1883"

[telemetry]
interval_secs = 5
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path)
        .map_err(|e| ConfigError::TrustMaterial(format!("{}: {e}", path.display())))
}

/// Device scoped telemetry topic for the given device id
pub fn telemetry_topic(device_id: &str) -> String {
    format!("devices/{device_id}/messages/events/")
}

/// Validate device ID format
fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'));

    if device_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must match pattern [a-zA-Z0-9._:-]+"
        )));
    }

    Ok(())
}

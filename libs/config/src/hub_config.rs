//! Hub Configuration Module
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! usable configuration. Durations are stored in milliseconds and exposed as
//! [`Duration`] through accessor methods.

use crate::defaults;
use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main hub configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    pub hub: HubSection,
    pub socket: SocketSection,
    pub connection: ConnectionSection,
    pub pool: PoolSection,
    pub request: RequestSection,
    /// TLS is enabled when this section is present
    pub tls: Option<TlsConfig>,
}

/// Local identity
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct HubSection {
    /// Hub id announced in the handshake; random when unset
    pub id: Option<String>,
}

/// Per-socket options
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SocketSection {
    pub no_delay: bool,
    pub send_timeout_ms: Option<u64>,
    pub receive_timeout_ms: Option<u64>,
}

impl Default for SocketSection {
    fn default() -> Self {
        Self {
            no_delay: true,
            send_timeout_ms: None,
            receive_timeout_ms: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConnectionSection {
    pub handshake_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_message_size: usize,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: defaults::connection::HANDSHAKE_TIMEOUT_MS,
            reconnect_delay_ms: defaults::connection::RECONNECT_DELAY_MS,
            max_message_size: defaults::connection::MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct PoolSection {
    pub segment_size: usize,
    pub max_retained: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            segment_size: defaults::pool::SEGMENT_SIZE,
            max_retained: defaults::pool::MAX_RETAINED,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RequestSection {
    pub timeout_ms: u64,
}

impl Default for RequestSection {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::request::TIMEOUT_MS,
        }
    }
}

/// PKCS#12 identity used for `tls://` endpoints
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// Server identity; only needed by hubs that listen on `tls://`
    pub identity_path: Option<PathBuf>,
    pub identity_password: String,
    /// Name checked against the server certificate; defaults to the endpoint host
    pub domain: Option<String>,
    pub accept_invalid_certs: bool,
}

impl HubConfig {
    /// Load configuration from an optional file with `HUBLINK_` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env_prefix(path, defaults::ENV_PREFIX)
    }

    /// Same as [`HubConfig::load`] with a custom environment prefix
    pub fn load_with_env_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading hub config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: HubConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        debug!(?config, "Hub configuration loaded");
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: HubConfig = toml::from_str(source).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the transport cannot operate with
    pub fn validate(&self) -> Result<()> {
        if matches!(self.hub.id.as_deref(), Some("")) {
            bail!("hub.id must not be empty");
        }
        if self.socket.send_timeout_ms == Some(0) {
            bail!("socket.send_timeout_ms must be greater than zero");
        }
        if self.socket.receive_timeout_ms == Some(0) {
            bail!("socket.receive_timeout_ms must be greater than zero");
        }
        if self.connection.handshake_timeout_ms == 0 {
            bail!("connection.handshake_timeout_ms must be greater than zero");
        }
        if self.connection.reconnect_delay_ms == 0 {
            bail!("connection.reconnect_delay_ms must be greater than zero");
        }
        if self.connection.max_message_size == 0 {
            bail!("connection.max_message_size must be greater than zero");
        }
        if self.pool.segment_size == 0 {
            bail!("pool.segment_size must be greater than zero");
        }
        if self.request.timeout_ms == 0 {
            bail!("request.timeout_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.socket.send_timeout_ms.map(Duration::from_millis)
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        self.socket.receive_timeout_ms.map(Duration::from_millis)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.handshake_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.connection.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        config.validate().unwrap();
        assert!(config.hub.id.is_none());
        assert!(config.socket.no_delay);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(2));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.pool.segment_size, 4096);
        assert!(config.send_timeout().is_none());
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_load_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("hub.toml");

        let config_content = r#"
[hub]
id = "edge-west"

[socket]
no_delay = false
send_timeout_ms = 1500

[connection]
reconnect_delay_ms = 250

[tls]
identity_path = "/etc/hublink/identity.p12"
identity_password = "secret"
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = HubConfig::load_with_env_prefix(Some(config_path.as_path()), "HUBLINK_TEST_FILE").unwrap();

        assert_eq!(config.hub.id.as_deref(), Some("edge-west"));
        assert!(!config.socket.no_delay);
        assert_eq!(config.send_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.reconnect_delay(), Duration::from_millis(250));
        // Untouched fields keep their defaults
        assert_eq!(config.handshake_timeout(), Duration::from_secs(2));

        let tls = config.tls.unwrap();
        assert_eq!(tls.identity_path, Some(PathBuf::from("/etc/hublink/identity.p12")));
        assert_eq!(tls.identity_password, "secret");
        assert!(!tls.accept_invalid_certs);
    }

    #[test]
    fn test_environment_override() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("hub.toml");
        fs::write(&config_path, "[connection]\nreconnect_delay_ms = 250\n").unwrap();

        std::env::set_var("HUBLINK_TEST_ENV_CONNECTION__RECONNECT_DELAY_MS", "75");
        std::env::set_var("HUBLINK_TEST_ENV_HUB__ID", "from-env");

        let config = HubConfig::load_with_env_prefix(Some(config_path.as_path()), "HUBLINK_TEST_ENV").unwrap();

        std::env::remove_var("HUBLINK_TEST_ENV_CONNECTION__RECONNECT_DELAY_MS");
        std::env::remove_var("HUBLINK_TEST_ENV_HUB__ID");

        assert_eq!(config.reconnect_delay(), Duration::from_millis(75));
        assert_eq!(config.hub.id.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(HubConfig::load_with_env_prefix(Some(missing.as_path()), "HUBLINK_TEST_MISSING").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(HubConfig::from_toml_str("[connection]\nhandshake_timeout_ms = 0\n").is_err());
        assert!(HubConfig::from_toml_str("[pool]\nsegment_size = 0\n").is_err());
        assert!(HubConfig::from_toml_str("[socket]\nreceive_timeout_ms = 0\n").is_err());
        assert!(HubConfig::from_toml_str("[hub]\nid = \"\"\n").is_err());
        assert!(HubConfig::from_toml_str("").is_ok());
    }
}

//! # Hublink Configuration
//!
//! Hub settings loaded from an optional TOML file, overridden by
//! `HUBLINK_`-prefixed environment variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use hublink_config::HubConfig;
//! use std::path::Path;
//!
//! let config = HubConfig::load(Some(Path::new("config/hub.toml")))?;
//! println!("handshake timeout: {:?}", config.handshake_timeout());
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! Environment keys use `__` between section and field, for example
//! `HUBLINK_CONNECTION__RECONNECT_DELAY_MS=250`.

pub mod defaults;
pub mod hub_config;

pub use hub_config::{
    ConnectionSection, HubConfig, HubSection, PoolSection, RequestSection, SocketSection,
    TlsConfig,
};

//! Default values shared by the configuration sections

/// Connection defaults
pub mod connection {
    /// Handshake exchange bound (milliseconds)
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 2_000;

    /// Fixed delay between dial attempts (milliseconds)
    pub const RECONNECT_DELAY_MS: u64 = 5_000;

    /// Largest payload accepted from a peer
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
}

/// Buffer pool defaults
pub mod pool {
    pub const SEGMENT_SIZE: usize = 4096;
    pub const MAX_RETAINED: usize = 1024;
}

/// Request client defaults
pub mod request {
    /// Reply wait bound (milliseconds)
    pub const TIMEOUT_MS: u64 = 30_000;
}

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "HUBLINK";

//! Connection configuration
//!
//! Compile-time defaults with runtime environment overrides, builder
//! methods for programmatic tuning.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Environment variables (runtime)
//! 2. Builder methods
//! 3. Library defaults

use std::time::Duration;

use mqwire_core::env::env_get;

/// Library defaults
pub mod defaults {
    /// Ring buffer size in bytes (power of two)
    pub const BUFFER_SIZE: u32 = 0x0002_0000; // 128 KiB

    /// Requested heartbeat interval in seconds (0 disables)
    pub const HEARTBEAT_SECS: u64 = 60;

    /// Highest channel number we are willing to negotiate
    pub const CHANNEL_MAX: u16 = 256;

    /// Largest frame size we are willing to negotiate
    pub const FRAME_MAX: u32 = 128 * 1024;

    /// Writer loop park timeout (bounded so cancellation is observed)
    pub const PARK_TIMEOUT_MS: u64 = 1000;

    /// Signal spin iterations before blocking
    pub const SIGNAL_SPINS: u32 = 10;
}

/// Connection configuration with builder pattern.
///
/// Use `from_env()` to start with library defaults and apply environment
/// variable overrides.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Ring buffer size in bytes, must be a power of two
    pub buffer_size: u32,
    /// Requested heartbeat interval (zero disables heartbeats)
    pub heartbeat: Duration,
    /// Highest channel number to negotiate
    pub channel_max: u16,
    /// Largest frame size to negotiate
    pub frame_max: u32,
    /// Writer loop park timeout
    pub park_timeout: Duration,
    /// Signal spin iterations before blocking
    pub signal_spins: u32,
    /// Virtual host to open
    pub vhost: String,
    /// SASL username
    pub username: String,
    /// SASL password
    pub password: String,
    /// Optional human-readable connection name sent to the broker
    pub connection_name: Option<String>,
    /// Immutable client identity table sent in the start-ok handshake
    pub client_properties: Vec<(String, String)>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ConnectionConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `MQWIRE_BUFFER_SIZE` - Ring buffer size in bytes
    /// - `MQWIRE_HEARTBEAT_SECS` - Heartbeat interval (0 disables)
    /// - `MQWIRE_CHANNEL_MAX` - Highest channel number
    /// - `MQWIRE_FRAME_MAX` - Largest frame size
    /// - `MQWIRE_PARK_TIMEOUT_MS` - Writer loop park timeout
    /// - `MQWIRE_SIGNAL_SPINS` - Spins before blocking on a signal
    pub fn from_env() -> Self {
        Self {
            buffer_size: env_get("MQWIRE_BUFFER_SIZE", defaults::BUFFER_SIZE),
            heartbeat: Duration::from_secs(env_get(
                "MQWIRE_HEARTBEAT_SECS",
                defaults::HEARTBEAT_SECS,
            )),
            channel_max: env_get("MQWIRE_CHANNEL_MAX", defaults::CHANNEL_MAX),
            frame_max: env_get("MQWIRE_FRAME_MAX", defaults::FRAME_MAX),
            park_timeout: Duration::from_millis(env_get(
                "MQWIRE_PARK_TIMEOUT_MS",
                defaults::PARK_TIMEOUT_MS,
            )),
            signal_spins: env_get("MQWIRE_SIGNAL_SPINS", defaults::SIGNAL_SPINS),
            vhost: "/".into(),
            username: "guest".into(),
            password: "guest".into(),
            connection_name: None,
            client_properties: default_client_properties(),
        }
    }

    /// Create config with explicit defaults (no env override).
    /// Useful for testing or when you want full control.
    pub fn new() -> Self {
        Self {
            buffer_size: defaults::BUFFER_SIZE,
            heartbeat: Duration::from_secs(defaults::HEARTBEAT_SECS),
            channel_max: defaults::CHANNEL_MAX,
            frame_max: defaults::FRAME_MAX,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            signal_spins: defaults::SIGNAL_SPINS,
            vhost: "/".into(),
            username: "guest".into(),
            password: "guest".into(),
            connection_name: None,
            client_properties: default_client_properties(),
        }
    }

    pub fn buffer_size(mut self, size: u32) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn channel_max(mut self, max: u16) -> Self {
        self.channel_max = max;
        self
    }

    pub fn frame_max(mut self, max: u32) -> Self {
        self.frame_max = max;
        self
    }

    pub fn park_timeout(mut self, timeout: Duration) -> Self {
        self.park_timeout = timeout;
        self
    }

    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }
}

/// Client identity table: built once at startup and passed into the
/// start-ok handshake, never mutated afterwards.
fn default_client_properties() -> Vec<(String, String)> {
    vec![
        ("product".into(), "mqwire".into()),
        ("version".into(), env!("CARGO_PKG_VERSION").into()),
        ("platform".into(), "rust".into()),
        ("information".into(), "https://github.com/mqwire/mqwire".into()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::new();
        assert!(config.buffer_size.is_power_of_two());
        assert_eq!(config.heartbeat, Duration::from_secs(60));
        assert!(config
            .client_properties
            .iter()
            .any(|(k, _)| k == "product"));
    }

    #[test]
    fn test_builder() {
        let config = ConnectionConfig::new()
            .buffer_size(4096)
            .heartbeat(Duration::from_secs(5))
            .connection_name("test-conn");
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.heartbeat, Duration::from_secs(5));
        assert_eq!(config.connection_name.as_deref(), Some("test-conn"));
    }
}

//! Server configuration.
//!
//! All knobs have firmware defaults, so an empty JSON object is a valid
//! configuration:
//!
//! ```
//! use websocketd::ServerConfig;
//!
//! let config = ServerConfig::from_json(r#"{ "port": 8081, "max_sessions": 2 }"#).unwrap();
//! assert_eq!(config.port, 8081);
//! assert_eq!(config.max_sessions, 2);
//! assert_eq!(config.ping_interval_ms, 3000);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WsError};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 81;

/// Default number of concurrent sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 4;

/// Default size of the shared RX and TX ring buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Initial size of the upgrade request buffer. Requests are refused past twice this.
pub const MAX_HTTP_HEADER_SIZE: usize = 512;

/// Idle time after which a keepalive ping is sent.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 3000;

/// Unanswered pings tolerated before the session is closed.
pub const DEFAULT_MAX_MISSED_PINGS: u8 = 3;

/// Default bound on out-of-band message reassembly.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4096;

/// Default bound on received input queued per session.
pub const DEFAULT_MAX_PENDING: usize = 4096;

/// Configuration for [`WebSocketServer`](crate::WebSocketServer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port to listen on.
    pub port: u16,
    /// Session pool capacity.
    pub max_sessions: usize,
    /// Shared RX ring capacity (one slot is kept free).
    pub rx_buffer_size: usize,
    /// Shared TX ring capacity (one slot is kept free).
    pub tx_buffer_size: usize,
    /// Initial upgrade request buffer size.
    pub max_http_header_size: usize,
    /// Idle time before a keepalive ping, in milliseconds.
    pub ping_interval_ms: u64,
    /// Pings that may go unanswered before closing.
    pub max_missed_pings: u8,
    /// Transport poll ticks without a send completion before abort (0 = never).
    pub socket_timeout: u32,
    /// Largest message accumulated for an out-of-band handler.
    pub max_message_size: usize,
    /// Received bytes a session may hold undecoded. Also the receive window
    /// the TCP front-end grants each connection.
    pub max_pending: usize,
    /// First connected session claims the shared stream automatically.
    pub auto_claim: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            rx_buffer_size: DEFAULT_BUFFER_SIZE,
            tx_buffer_size: DEFAULT_BUFFER_SIZE,
            max_http_header_size: MAX_HTTP_HEADER_SIZE,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            max_missed_pings: DEFAULT_MAX_MISSED_PINGS,
            socket_timeout: 0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_pending: DEFAULT_MAX_PENDING,
            auto_claim: true,
        }
    }
}

impl ServerConfig {
    /// Create a default configuration listening on `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to JSON (e.g. for a settings dump).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check that every size is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(WsError::Config("max_sessions must be at least 1".to_string()));
        }
        if self.rx_buffer_size < 2 || self.tx_buffer_size < 2 {
            return Err(WsError::Config(
                "ring buffers need at least 2 bytes".to_string(),
            ));
        }
        if self.max_http_header_size < 64 {
            return Err(WsError::Config(format!(
                "max_http_header_size {} is too small",
                self.max_http_header_size
            )));
        }
        if self.max_pending == 0 {
            return Err(WsError::Config("max_pending must be non-zero".to_string()));
        }
        if self.ping_interval_ms == 0 {
            return Err(WsError::Config("ping_interval_ms must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Keepalive interval as a `Duration`.
    #[inline]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Upgrade requests longer than this without `CRLF CRLF` are refused.
    #[inline]
    pub fn http_request_cap(&self) -> usize {
        self.max_http_header_size * 2
    }
}

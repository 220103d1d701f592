//! Configuration schema types for Huddle.
//!
//! All structs use `serde(default)` so partial configs work correctly.

use serde::{Deserialize, Serialize};

/// Current config schema version.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

// =============================================================================
// Relay Config
// =============================================================================

/// Signaling relay connection settings (client side) and listen settings
/// (server side).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket URL of the relay the client connects to.
    pub url: String,
    /// Port the relay server listens on.
    pub listen_port: u32,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval: u32,
    /// Reconnect delay (base) in seconds.
    pub reconnect_delay: u32,
    /// Maximum reconnect delay in seconds.
    pub max_reconnect_delay: u32,
    /// Seconds to wait for the relay to acknowledge a request.
    pub request_timeout: u32,
    /// Seconds without any frame after which the relay drops a client.
    pub idle_timeout: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".into(),
            listen_port: 8080,
            heartbeat_interval: 25,
            reconnect_delay: 1,
            max_reconnect_delay: 30,
            request_timeout: 10,
            idle_timeout: 60,
        }
    }
}

// =============================================================================
// Presence Config
// =============================================================================

/// Presence tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub enabled: bool,
    /// Evict room members whose presence goes offline after they joined.
    pub evict_offline_members: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            evict_offline_members: true,
        }
    }
}

// =============================================================================
// Voice Config
// =============================================================================

/// One STUN/TURN server handed to the peer connection as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Voice room configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub enabled: bool,
    /// Maximum participants per room. A full mesh grows quadratically.
    pub max_participants: u32,
    /// Preferred microphone; `None` uses the system default.
    pub input_device: Option<String>,
    /// Preferred speaker for remote audio; `None` is the system default.
    pub output_device: Option<String>,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_participants: 8,
            input_device: None,
            output_device: None,
            ice_servers: vec![
                IceServerConfig {
                    urls: vec![
                        "stun:stun1.l.google.com:19302".into(),
                        "stun:stun2.l.google.com:19302".into(),
                    ],
                    username: None,
                    credential: None,
                },
                IceServerConfig {
                    urls: vec!["turn:openrelay.metered.ca:80".into()],
                    username: Some("openrelayproject".into()),
                    credential: Some("openrelayproject".into()),
                },
            ],
        }
    }
}

// =============================================================================
// Logging Config
// =============================================================================

/// Log level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
#[derive(Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// The level name as understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
        }
    }
}

impl LoggingConfig {
    /// Filter directive scoping `level` to the huddle crates.
    pub fn directive(&self) -> String {
        let level = self.level.as_filter();
        format!("huddle_relay={level},huddle_mesh={level},huddle_common={level}")
    }
}

// =============================================================================
// Root
// =============================================================================

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HuddleConfig {
    pub relay: RelayConfig,
    pub presence: PresenceConfig,
    pub voice: VoiceConfig,
    pub logging: LoggingConfig,
}

// =============================================================================
// Tests
// =============================================================================

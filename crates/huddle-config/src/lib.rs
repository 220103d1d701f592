//! Huddle configuration system.
//!
//! Provides TOML-based configuration with validation. All config sections
//! use sensible defaults so partial configs work out of the box.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use huddle_config::{load_config, config_to_json};
//!
//! let config = load_config().expect("failed to load config");
//! let json = config_to_json(&config);
//! println!("{json}");
//! ```

pub mod schema;
pub mod toml_loader;
pub mod validation;

// Re-export core types for convenience
pub use schema::{
    HuddleConfig, IceServerConfig, LogLevel, LoggingConfig, PresenceConfig, RelayConfig,
    VoiceConfig, CONFIG_SCHEMA_VERSION,
};

use huddle_common::ConfigError;

/// Load config from the platform default path and validate it.
///
/// Creates a documented default file if none exists.
pub fn load_config() -> Result<HuddleConfig, ConfigError> {
    let config = toml_loader::load_default()?;
    validation::validate(&config)?;
    Ok(config)
}

/// Load config from an explicit path and validate it.
pub fn load_config_from(path: &std::path::Path) -> Result<HuddleConfig, ConfigError> {
    let config = toml_loader::load_from_path(path)?;
    validation::validate(&config)?;
    Ok(config)
}

/// Serialize a config to a pretty-printed JSON string.
pub fn config_to_json(config: &HuddleConfig) -> String {
    serde_json::to_string_pretty(config)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize config: {e}\"}}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_to_json_contains_all_sections() {
        let config = HuddleConfig::default();
        let json = config_to_json(&config);
        assert!(json.contains("\"relay\""));
        assert!(json.contains("\"presence\""));
        assert!(json.contains("\"voice\""));
        assert!(json.contains("\"logging\""));
        assert!(json.contains("\"ice_servers\""));
    }

    #[test]
    fn config_schema_version_is_1() {
        assert_eq!(CONFIG_SCHEMA_VERSION, 1);
    }

    #[test]
    fn default_config_round_trips_through_json() {
        let config = HuddleConfig::default();
        let json = config_to_json(&config);
        let parsed: HuddleConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.relay.url, "ws://127.0.0.1:8080");
        assert_eq!(parsed.voice.max_participants, 8);
    }

    #[test]
    fn load_config_from_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[voice]\nmax_participants = 0\n").unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }
}

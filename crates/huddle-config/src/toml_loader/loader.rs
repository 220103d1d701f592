//! Reading `config.toml` into a [`HuddleConfig`].

use std::io::ErrorKind;
use std::path::Path;

use huddle_common::ConfigError;
use tracing::{debug, info};

use super::paths::{create_default_config, default_config_path};
use crate::schema::HuddleConfig;

/// Parse the TOML file at `path`. Missing fields take their defaults.
/// Range checks are left to [`crate::validation::validate`].
pub fn load_from_path(path: &Path) -> Result<HuddleConfig, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        Err(e) => {
            return Err(ConfigError::ParseError(format!(
                "cannot read {}: {e}",
                path.display()
            )))
        }
    };

    let config = toml::from_str::<HuddleConfig>(&content)
        .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
    debug!(path = %path.display(), "Config parsed");
    Ok(config)
}

/// Load the per-user config file, writing the documented template first
/// when there is none yet.
pub fn load_default() -> Result<HuddleConfig, ConfigError> {
    let path = default_config_path()?;
    match load_from_path(&path) {
        Err(ConfigError::FileNotFound(_)) => {
            create_default_config(&path)?;
            info!(path = %path.display(), "Wrote default config");
            Ok(HuddleConfig::default())
        }
        other => other,
    }
}

//! Where the per-user config lives.

use std::path::{Path, PathBuf};

use huddle_common::ConfigError;

use super::template::default_config_toml;

/// `<config dir>/huddle/config.toml`, e.g. `~/.config/huddle/config.toml`
/// on Linux.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    match dirs::config_dir() {
        Some(dir) => Ok(dir.join("huddle").join("config.toml")),
        None => Err(ConfigError::ParseError(
            "no per-user config directory on this platform".into(),
        )),
    }
}

/// Write the documented template to `path`, creating parent directories.
pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, default_config_toml())
    };
    write().map_err(|e| ConfigError::ParseError(format!("cannot create {}: {e}", path.display())))
}

//! Configuration loading from `~/.agentmesh/config.toml` with defaults.

use agentmesh_types::config::MeshConfig;
use agentmesh_types::error::{MeshError, MeshResult};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load mesh configuration from a TOML file, with defaults.
///
/// A missing, unreadable, unparsable or invalid file yields
/// `MeshConfig::default()`; the reason is logged.
pub fn load_config(path: Option<&Path>) -> MeshConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return MeshConfig::default();
    }

    match read_config(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to load config, using defaults"
            );
            MeshConfig::default()
        }
    }
}

/// Strict variant of [`load_config`]: a missing file still yields defaults,
/// but any other failure is returned.
pub fn try_load_config(path: Option<&Path>) -> MeshResult<MeshConfig> {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);
    if !config_path.exists() {
        return Ok(MeshConfig::default());
    }
    read_config(&config_path)
}

fn read_config(path: &Path) -> MeshResult<MeshConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: MeshConfig = toml::from_str(&contents)
        .map_err(|e| MeshError::Config(format!("{}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Render a config as TOML, e.g. for `agentmesh config`.
pub fn to_toml(config: &MeshConfig) -> MeshResult<String> {
    toml::to_string_pretty(config).map_err(|e| MeshError::Serialization(e.to_string()))
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    agentmesh_home().join("config.toml")
}

/// Get the agentmesh home directory.
pub fn agentmesh_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".agentmesh")
}

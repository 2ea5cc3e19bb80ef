use std::path::{Path, PathBuf};

use crate::config::types::ManagerConfig;
use crate::error::{ManagerError, Result};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = project_dirs() {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".sandbox-manager").join("config.toml")
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "sandbox-manager", "sandbox-manager")
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(config_path: Option<&Path>) -> Result<ManagerConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        if config_path.is_some() {
            return Err(ManagerError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        return Ok(ManagerConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: ManagerConfig =
        toml::from_str(&content).map_err(|e| ManagerError::TomlParse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &ManagerConfig) -> Result<()> {
    if config.engine.binary.trim().is_empty() {
        return Err(ManagerError::Config("engine.binary must not be empty".into()));
    }
    if config.engine.pod_prefix.is_empty() {
        return Err(ManagerError::Config(
            "engine.pod_prefix must not be empty".into(),
        ));
    }
    if config.directory.enabled && config.directory.server_url.trim().is_empty() {
        return Err(ManagerError::Config(
            "directory.server_url is required when the mirror is enabled".into(),
        ));
    }
    Ok(())
}

/// Get the data directory for process logs
pub fn get_data_dir() -> PathBuf {
    if let Some(proj_dirs) = project_dirs() {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs_fallback()
            .join(".local")
            .join("share")
            .join("sandbox-manager")
    }
}

//! Locations under `~/.landrop/`.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Returns the base directory: `~/.landrop/`
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".landrop"))
}

/// Returns the config file path: `~/.landrop/config.json`
pub fn config_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("config.json"))
}

/// Returns the persisted identity: `~/.landrop/identity.json`
pub fn identity_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("identity.json"))
}

/// Returns the logs directory: `~/.landrop/logs/`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(base_dir()?.join("logs"))
}

/// Host name used as device name when none is given.
pub fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "LanDrop device".to_string())
}

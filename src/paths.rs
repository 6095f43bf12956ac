//! Config path resolution for mcpmux
//!
//! Follows the XDG Base Directory Specification with an env var override.
//!
//! | Source | Example |
//! |--------|---------|
//! | `MCPMUX_CONFIG` | `/etc/mcpmux.toml` |
//! | first CLI argument | `mcpmux ./gateway.toml` |
//! | `XDG_CONFIG_HOME` | `~/.config/mcpmux/config.toml` |

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Get the XDG config directory for mcpmux
///
/// Priority: `XDG_CONFIG_HOME` > `~/.config`
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("mcpmux");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config/mcpmux");
    }

    // Last resort: current directory
    PathBuf::from(".")
}

/// Resolve the gateway config file.
///
/// Priority: `MCPMUX_CONFIG` env var > `cli_arg` > `config_dir()/config.toml`
pub fn config_path(cli_arg: Option<&str>) -> PathBuf {
    if let Ok(path) = std::env::var("MCPMUX_CONFIG") {
        return PathBuf::from(path);
    }
    cli_arg
        .map(PathBuf::from)
        .unwrap_or_else(|| config_dir().join("config.toml"))
}

/// Create an empty config file (and its directory) when none exists, so the
/// gateway can start and be populated through the admin API.
pub fn ensure_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        debug!("creating config directory: {}", dir.display());
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory: {}", dir.display()))?;
    }
    std::fs::write(path, "")
        .with_context(|| format!("failed to create config file: {}", path.display()))?;
    Ok(())
}

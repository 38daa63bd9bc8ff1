use std::path::PathBuf;

use anyhow::{Context, Result};

/// Returns the base directory: `~/.gesture_sync/`
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".gesture_sync"))
}

/// Returns the config file path: `~/.gesture_sync/config.json`
pub fn config_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("config.json"))
}

/// Returns the logs directory: `~/.gesture_sync/logs/`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(base_dir()?.join("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_live_under_base_dir() {
        let base = base_dir().unwrap();
        assert!(base.ends_with(".gesture_sync"));
        assert_eq!(config_path().unwrap(), base.join("config.json"));
        assert_eq!(logs_dir().unwrap(), base.join("logs"));
    }
}

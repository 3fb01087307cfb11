// src/core/paths.rs

use crate::constants::{
    CATALOG_FILENAME, HOME_DIR_NAME, HOME_ENV_VAR, PERSISTED_ENV_FILENAME, SESSIONS_DIR_NAME,
};
use lazy_static::lazy_static;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

lazy_static! {
    static ref FLOWRUN_HOME_DIR: Mutex<Option<PathBuf>> = Mutex::new(None);
}

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Could not find system config directory.")]
    ConfigDirNotFound,
    #[error("Could not create config directory at '{path}': {source}")]
    ConfigDirCreation {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to expand path '{template}': {reason}")]
    Expansion { template: String, reason: String },
}

/// Returns the flowrun home directory (`~/.config/flowrun`, or `$FLOWRUN_HOME`).
/// Creates it if it doesn't exist.
///
/// This function is memoized: the first call computes and caches the path,
/// subsequent calls return the cached value instantly.
pub fn get_flowrun_home() -> Result<PathBuf, PathError> {
    let mut cached_path_guard = FLOWRUN_HOME_DIR.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(path) = &*cached_path_guard {
        return Ok(path.clone());
    }

    // --- Cache miss: compute the path for the first time ---
    let home = match std::env::var(HOME_ENV_VAR) {
        Ok(custom) if !custom.trim().is_empty() => expand_path(&custom)?,
        _ => dirs::config_dir()
            .ok_or(PathError::ConfigDirNotFound)?
            .join(HOME_DIR_NAME),
    };

    if !home.exists() {
        fs::create_dir_all(&home).map_err(|e| PathError::ConfigDirCreation {
            path: home.display().to_string(),
            source: e,
        })?;
    }

    *cached_path_guard = Some(home.clone());
    Ok(home)
}

/// The command catalog (`<home>/flowrun.toml`).
pub fn get_catalog_path() -> Result<PathBuf, PathError> {
    get_flowrun_home().map(|dir| dir.join(CATALOG_FILENAME))
}

/// The env snapshot shared across runs (`<home>/env`).
pub fn get_persisted_env_path() -> Result<PathBuf, PathError> {
    get_flowrun_home().map(|dir| dir.join(PERSISTED_ENV_FILENAME))
}

/// The sessions root: the configured template, or `<home>/sessions`.
pub fn get_sessions_dir(configured: Option<&str>) -> Result<PathBuf, PathError> {
    match configured {
        Some(template) if !template.trim().is_empty() => expand_path(template),
        _ => get_flowrun_home().map(|dir| dir.join(SESSIONS_DIR_NAME)),
    }
}

/// Expands `~` and environment variables (`$VAR`) in a path, cleaning the result
/// the way Windows users expect (no `\\?\` prefixes).
pub fn expand_path(template: &str) -> Result<PathBuf, PathError> {
    let expanded = shellexpand::full(template).map_err(|e| PathError::Expansion {
        template: template.to_string(),
        reason: e.to_string(),
    })?;
    Ok(dunce::simplified(&PathBuf::from(expanded.into_owned())).to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_resolves_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_path("~/flows").unwrap(), home.join("flows"));
    }

    #[test]
    fn test_expand_path_reports_unknown_variable() {
        let err = expand_path("$FLOWRUN_SURELY_UNSET_VARIABLE_42/x").unwrap_err();
        assert!(matches!(err, PathError::Expansion { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_configured_sessions_dir_wins() {
        let dir = get_sessions_dir(Some("/tmp/flowrun-sessions")).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/flowrun-sessions"));
    }
}

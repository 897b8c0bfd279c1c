//! Config file discovery.
//!
//! The config lives next to the process in `ngrpc.json`. A developer may drop an
//! `ngrpc.local.json` beside it; when present, the local file replaces the primary
//! one entirely (no field-level merging).

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Format, Json};

use crate::error::ConfigError;
use crate::model::Config;

pub const CONFIG_FILE: &str = "ngrpc.json";
pub const LOCAL_CONFIG_FILE: &str = "ngrpc.local.json";

/// Load the config from the current working directory.
///
/// # Errors
/// Returns [`ConfigError::NotFound`] naming the absolute path of `ngrpc.json` when
/// neither config file exists, or [`ConfigError::Invalid`] when the chosen file
/// cannot be parsed.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::NotFound {
        path: PathBuf::from(CONFIG_FILE),
    })?;
    load_config_from(&cwd)
}

/// Load the config from `dir`.
///
/// # Errors
/// Same as [`load_config`].
pub fn load_config_from(dir: &Path) -> Result<Config, ConfigError> {
    let path = locate(dir)?;

    let config: Config = Figment::new()
        .merge(Json::file_exact(&path))
        .extract()
        .map_err(|e| ConfigError::Invalid {
            path: path.clone(),
            source: Box::new(e),
        })?;

    tracing::debug!(
        path = %path.display(),
        apps = config.apps.len(),
        "Loaded ngrpc config"
    );

    Ok(config)
}

fn locate(dir: &Path) -> Result<PathBuf, ConfigError> {
    let local = dir.join(LOCAL_CONFIG_FILE);
    if local.is_file() {
        return Ok(local);
    }

    let primary = dir.join(CONFIG_FILE);
    if primary.is_file() {
        return Ok(primary);
    }

    Err(ConfigError::NotFound { path: primary })
}

use std::env;
use std::path::PathBuf;

use crate::CatalogError;

const SERVERS_FILENAME: &str = "servers.json";
const PROFILES_FILENAME: &str = "profiles_metadata.json";
const OVERRIDE_ENV_VAR: &str = "MCPM_CONFIG_DIR";

/// Resolves `{config_dir}/mcpm/`, honoring `MCPM_CONFIG_DIR` so tests (and
/// operators) can redirect the catalog without touching `$HOME`.
pub fn config_dir() -> Result<PathBuf, CatalogError> {
    if let Ok(dir) = env::var(OVERRIDE_ENV_VAR) {
        return Ok(PathBuf::from(dir));
    }
    let dirs = directories::ProjectDirs::from("", "", "mcpm")
        .ok_or(CatalogError::NoConfigDir)?;
    Ok(dirs.config_dir().to_path_buf())
}

pub fn servers_path() -> Result<PathBuf, CatalogError> {
    Ok(config_dir()?.join(SERVERS_FILENAME))
}

pub fn profiles_path() -> Result<PathBuf, CatalogError> {
    Ok(config_dir()?.join(PROFILES_FILENAME))
}

//! Platform directories used as defaults for the runtime module directory

use std::path::PathBuf;

use anyhow::{Context, Result};
use etcetera::{BaseStrategy, choose_base_strategy};

/// Name of the directory the deployment runtime loads modules from
pub const RUNTIME_DIR_NAME: &str = "lua";

/// Default deployment/runtime module directory
///
/// `%LOCALAPPDATA%\lua` when `LOCALAPPDATA` is set (the Windows runtime layout),
/// otherwise `lua` under the platform data directory, e.g. `~/.local/share/lua`.
pub fn default_deploy_dir() -> Result<PathBuf> {
    if let Some(local_app_data) = std::env::var_os("LOCALAPPDATA")
        && !local_app_data.is_empty()
    {
        return Ok(PathBuf::from(local_app_data).join(RUNTIME_DIR_NAME));
    }

    let strategy =
        choose_base_strategy().context("Could not determine the user's home directory")?;
    Ok(strategy.data_dir().join(RUNTIME_DIR_NAME))
}

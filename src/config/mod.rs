//! Pipeline settings persisted as `config.toml` in the app root.

mod defaults;
mod types;

use std::path::{Path, PathBuf};

use crate::app_dirs;

pub use types::{ConfigError, DatasetSettings, PipelineSettings, TrainingSettings};

/// Default filename used to store pipeline settings.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Resolve the settings file path, ensuring the app root exists.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let dir = app_dirs::app_root_dir().map_err(map_app_dir_error)?;
    Ok(dir.join(CONFIG_FILE_NAME))
}

/// Load settings from the app root, returning defaults if the file is missing.
pub fn load_or_default() -> Result<PipelineSettings, ConfigError> {
    load_from_path(&config_path()?)
}

pub fn load_from_path(path: &Path) -> Result<PipelineSettings, ConfigError> {
    if !path.exists() {
        return Ok(PipelineSettings::default());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<PipelineSettings>(&text)
        .map(PipelineSettings::normalized)
        .map_err(|source| ConfigError::ParseToml {
            path: path.to_path_buf(),
            source,
        })
}

/// Persist settings to the app root.
pub fn save(settings: &PipelineSettings) -> Result<(), ConfigError> {
    save_to_path(settings, &config_path()?)
}

/// Save settings to a specific path, creating parent directories as needed.
pub fn save_to_path(settings: &PipelineSettings, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let data = toml::to_string_pretty(settings).map_err(|source| ConfigError::SerializeToml {
        path: path.to_path_buf(),
        source,
    })?;
    crate::atomic_file::atomic_write(path, data.as_bytes()).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn map_app_dir_error(error: app_dirs::AppDirError) -> ConfigError {
    match error {
        app_dirs::AppDirError::NoBaseDir => ConfigError::NoConfigDir,
        app_dirs::AppDirError::CreateDir { path, source } => ConfigError::CreateDir { path, source },
    }
}

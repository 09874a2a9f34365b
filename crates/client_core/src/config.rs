use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub origin_base_url: String,
    pub cache_database_url: String,
    pub request_timeout_ms: u64,
    pub stream_buffer: usize,
    pub worker_threads: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            origin_base_url: "http://127.0.0.1:8080/api/".into(),
            cache_database_url: "sqlite://./data/cache.db".into(),
            request_timeout_ms: 10_000,
            stream_buffer: 16,
            worker_threads: 4,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse settings file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    origin_base_url: Option<String>,
    cache_database_url: Option<String>,
    request_timeout_ms: Option<u64>,
    stream_buffer: Option<usize>,
    worker_threads: Option<usize>,
}

/// Loads settings from `path` (or `client.toml` in the working directory when
/// present), then applies `APP__*` environment overrides.
///
/// An explicitly requested file must exist; the default file is optional.
pub fn load_settings(path: Option<&Path>) -> Result<ClientSettings, SettingsError> {
    let mut settings = ClientSettings::default();

    let (file_path, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_SETTINGS_FILE), false),
    };
    match fs::read_to_string(&file_path) {
        Ok(raw) => {
            let file_cfg: FileSettings = toml::from_str(&raw).map_err(|source| SettingsError::Parse {
                path: file_path.clone(),
                source,
            })?;
            apply_file(&mut settings, file_cfg);
            debug!(path = %file_path.display(), "loaded client settings file");
        }
        Err(source) if required || source.kind() != std::io::ErrorKind::NotFound => {
            return Err(SettingsError::Read {
                path: file_path,
                source,
            });
        }
        Err(_) => {}
    }

    apply_env(&mut settings, |key| std::env::var(key).ok())?;
    Ok(settings)
}

fn apply_file(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.origin_base_url {
        settings.origin_base_url = v;
    }
    if let Some(v) = file_cfg.cache_database_url {
        settings.cache_database_url = v;
    }
    if let Some(v) = file_cfg.request_timeout_ms {
        settings.request_timeout_ms = v;
    }
    if let Some(v) = file_cfg.stream_buffer {
        settings.stream_buffer = v.max(1);
    }
    if let Some(v) = file_cfg.worker_threads {
        settings.worker_threads = v.max(1);
    }
}

fn apply_env(
    settings: &mut ClientSettings,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), SettingsError> {
    if let Some(v) = var("APP__ORIGIN_BASE_URL") {
        settings.origin_base_url = v;
    }
    if let Some(v) = var("APP__CACHE_DATABASE_URL") {
        settings.cache_database_url = v;
    }
    if let Some(v) = var("APP__REQUEST_TIMEOUT_MS") {
        settings.request_timeout_ms = parse_number("APP__REQUEST_TIMEOUT_MS", v)?;
    }
    if let Some(v) = var("APP__STREAM_BUFFER") {
        settings.stream_buffer = parse_number::<usize>("APP__STREAM_BUFFER", v)?.max(1);
    }
    if let Some(v) = var("APP__WORKER_THREADS") {
        settings.worker_threads = parse_number::<usize>("APP__WORKER_THREADS", v)?.max(1);
    }
    Ok(())
}

fn parse_number<N: std::str::FromStr>(key: &'static str, value: String) -> Result<N, SettingsError> {
    value
        .trim()
        .parse()
        .map_err(|_| SettingsError::InvalidValue { key, value })
}

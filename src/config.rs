use crate::client::ClientMetadata;
use crate::error::AppError;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SERVICE_NAME: &str = "quotawatch";
pub const MIN_REFRESH_SECONDS: u64 = 30;
pub const ALERT_THRESHOLD_RANGE: (u8, u8) = (5, 50);

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("QUOTAWATCH_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("com", "quotawatch", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".quotawatch"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub enabled: bool,
    pub refresh_seconds: u64,
    pub pinned_models: Vec<String>,
    pub alert_threshold: u8,
    pub ide_name: String,
    pub extension_name: String,
    pub locale: String,
    pub process_name: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let metadata = ClientMetadata::default();
        Self {
            enabled: true,
            refresh_seconds: 120,
            pinned_models: vec![],
            alert_threshold: 20,
            ide_name: metadata.ide_name,
            extension_name: metadata.extension_name,
            locale: metadata.locale,
            process_name: None,
        }
    }
}

impl AppConfig {
    pub fn client_metadata(&self) -> ClientMetadata {
        ClientMetadata {
            ide_name: self.ide_name.clone(),
            extension_name: self.extension_name.clone(),
            locale: self.locale.clone(),
        }
    }

    pub fn is_pinned(&self, id: &str) -> bool {
        self.pinned_models.iter().any(|p| p == id)
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

fn normalize_config(config: &mut AppConfig) -> bool {
    let mut changed = false;

    if config.refresh_seconds < MIN_REFRESH_SECONDS {
        config.refresh_seconds = MIN_REFRESH_SECONDS;
        changed = true;
    }

    let (lo, hi) = ALERT_THRESHOLD_RANGE;
    let threshold = config.alert_threshold.clamp(lo, hi);
    if threshold != config.alert_threshold {
        config.alert_threshold = threshold;
        changed = true;
    }

    let mut pinned = Vec::new();
    for model in &config.pinned_models {
        let trimmed = model.trim().to_string();
        if trimmed != *model {
            changed = true;
        }
        if trimmed.is_empty() || pinned.iter().any(|p: &String| p == &trimmed) {
            changed = true;
            continue;
        }
        pinned.push(trimmed);
    }
    config.pinned_models = pinned;

    if config
        .process_name
        .as_deref()
        .is_some_and(|name| name.trim().is_empty())
    {
        config.process_name = None;
        changed = true;
    }

    changed
}

pub fn load_config() -> Result<AppConfig, AppError> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let raw = fs::read_to_string(&path)?;
    let mut parsed: AppConfig = toml::from_str(&raw)?;

    // Persist corrected values so the file matches what is in effect.
    if normalize_config(&mut parsed) {
        save_config(&parsed)?;
    }

    Ok(parsed)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}

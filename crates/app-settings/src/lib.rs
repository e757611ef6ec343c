use core_types::ServableFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Error)]
pub enum AppSettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings path unavailable")]
    MissingSettingsPath,
}

pub type Result<T> = std::result::Result<T, AppSettingsError>;

/// Runtime configuration of the image store.
///
/// Every field falls back to its default when missing from the settings file,
/// so older files keep loading as new options are added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Directory holding the content-addressed blobs.
    pub media_root: PathBuf,
    pub database_path: PathBuf,
    /// Public prefix joined with a blob reference to build an image URL.
    pub media_url: String,
    pub servable_formats: Vec<ServableFormat>,
    /// Upper bound on how long a statement waits for a locked database.
    pub busy_timeout_ms: u64,
    pub log_filter: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        let data_dir = data_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            media_root: data_dir.join("media"),
            database_path: data_dir.join("tagstore.sqlite3"),
            media_url: "/media/".to_string(),
            servable_formats: ServableFormat::ALL.to_vec(),
            busy_timeout_ms: 5_000,
            log_filter: "info".to_string(),
        }
    }
}

impl AppSettings {
    pub fn load() -> Result<Self> {
        Self::load_from(settings_file_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(settings_file_path()?)
    }

    /// Reads settings from `path`, returning defaults when the file does not exist.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let settings: AppSettings = serde_json::from_str(&content)?;
            Ok(settings)
        } else {
            Ok(AppSettings::default())
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let payload = serde_json::to_string_pretty(self)?;
        std::fs::write(path, payload)?;
        Ok(())
    }

    pub fn image_url(&self, blob_reference: &str) -> String {
        if self.media_url.ends_with('/') {
            format!("{}{blob_reference}", self.media_url)
        } else {
            format!("{}/{blob_reference}", self.media_url)
        }
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("org", "tagstore", "tagstore")
        .ok_or(AppSettingsError::MissingSettingsPath)
}

fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

pub fn settings_file_path() -> Result<PathBuf> {
    let mut path = project_dirs()?.config_dir().to_path_buf();
    path.push(SETTINGS_FILE);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings::load_from(dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, AppSettings::default());
        assert_eq!(settings.servable_formats.len(), ServableFormat::ALL.len());
        assert_eq!(settings.busy_timeout_ms, 5_000);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{ "media_url": "https://cdn.example/", "servable_formats": ["png"] }"#,
        )
        .unwrap();

        let settings = AppSettings::load_from(&path).unwrap();
        assert_eq!(settings.media_url, "https://cdn.example/");
        assert_eq!(settings.servable_formats, vec![ServableFormat::Png]);
        assert_eq!(settings.log_filter, "info");
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = AppSettings {
            media_root: dir.path().join("media"),
            database_path: dir.path().join("db.sqlite3"),
            busy_timeout_ms: 250,
            ..AppSettings::default()
        };
        settings.save_to(&path).unwrap();
        assert_eq!(AppSettings::load_from(&path).unwrap(), settings);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            AppSettings::load_from(&path),
            Err(AppSettingsError::Json(_))
        ));
    }

    #[test]
    fn image_url_joins_prefix() {
        let mut settings = AppSettings::default();
        assert_eq!(settings.image_url("ab.png"), "/media/ab.png");
        settings.media_url = "/static".into();
        assert_eq!(settings.image_url("ab.png"), "/static/ab.png");
    }
}

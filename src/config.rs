//! Store configuration.
//!
//! Read from `~/.emailsort/config.json` when present, then overridden by the
//! environment: `DATABASE_URL` (a file path or `sqlite://` URL) and
//! `DATABASE_KEY` (the store's access key). The binary loads `.env` first.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DATABASE_URL_VAR: &str = "DATABASE_URL";
pub const DATABASE_KEY_VAR: &str = "DATABASE_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Unsupported database URL `{0}`: expected a file path or sqlite:// URL")]
    UnsupportedUrl(String),

    #[error("An access key is configured but this build has no encryption support (enable the `sqlcipher` feature)")]
    EncryptionUnavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub backup_before_migrate: bool,
}

fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".emailsort")
        .join("emailsort.db")
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            access_key: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            backup_before_migrate: true,
        }
    }
}

impl Config {
    /// Resolve the config file location: `~/.emailsort/config.json`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
        Ok(home.join(".emailsort").join("config.json"))
    }

    /// Load from `path` (or the default location), falling back to defaults when
    /// the file is absent, then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_overrides(
            std::env::var(DATABASE_URL_VAR).ok().as_deref(),
            std::env::var(DATABASE_KEY_VAR).ok().as_deref(),
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Environment values win over the file. Empty values are ignored.
    pub fn apply_overrides(
        &mut self,
        database_url: Option<&str>,
        access_key: Option<&str>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = database_url.filter(|v| !v.trim().is_empty()) {
            self.database_path = database_path_from_url(url.trim())?;
        }
        if let Some(key) = access_key.filter(|v| !v.is_empty()) {
            self.access_key = Some(key.to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_key.is_some() && !cfg!(feature = "sqlcipher") {
            return Err(ConfigError::EncryptionUnavailable);
        }
        Ok(())
    }
}

/// Accepts `sqlite:///abs/path.db`, `sqlite://rel.db`, `sqlite:rel.db`, or a bare path.
fn database_path_from_url(url: &str) -> Result<PathBuf, ConfigError> {
    if let Some(rest) = url.strip_prefix("sqlite://") {
        return Ok(PathBuf::from(rest));
    }
    if let Some(rest) = url.strip_prefix("sqlite:") {
        return Ok(PathBuf::from(rest));
    }
    if url.contains("://") {
        return Err(ConfigError::UnsupportedUrl(url.to_string()));
    }
    Ok(PathBuf::from(url))
}

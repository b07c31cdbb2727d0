//! Config directory resolution and persisted user settings.
//!
//! Directory priority:
//! 1. CLI `--config-dir`
//! 2. `NUTRICAM_CONFIG_DIR` environment variable
//! 3. Current folder, if it already holds `nutricam.json` or `nutricam.log`
//! 4. Platform directory from dirs-next
//!
//! Platform paths:
//! - Linux: ~/.config/nutricam/{name}
//! - macOS: ~/Library/Application Support/nutricam/{name}
//! - Windows: %APPDATA%\nutricam\{name}

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::core::stream::DEFAULT_STREAM_PORT;

pub const SETTINGS_FILE: &str = "nutricam.json";
pub const LOG_FILE: &str = "nutricam.log";
pub const CONFIG_DIR_ENV: &str = "NUTRICAM_CONFIG_DIR";

pub const DEFAULT_CAMERA_IP: &str = "192.168.1.4";
pub const DEFAULT_API_URL: &str = "https://kcalculateai.vercel.app";

// ===== Paths =====

/// Override for the default application directories
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI arg -> `NUTRICAM_CONFIG_DIR` -> None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from));
        Self { config_dir }
    }

    /// Path to a configuration file
    pub fn config_file(&self, name: &str) -> PathBuf {
        self.resolve(dirs_next::config_dir).join(name)
    }

    /// Path to a data file (logs)
    pub fn data_file(&self, name: &str) -> PathBuf {
        self.resolve(dirs_next::data_dir).join(name)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_file(SETTINGS_FILE)
    }

    /// Create config and data directories if missing
    pub fn ensure_dirs(&self) -> Result<()> {
        let config_dir = self.resolve(dirs_next::config_dir);
        let data_dir = self.resolve(dirs_next::data_dir);

        fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;
        if data_dir != config_dir {
            fs::create_dir_all(&data_dir)
                .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
        }
        Ok(())
    }

    fn resolve(&self, platform: fn() -> Option<PathBuf>) -> PathBuf {
        if let Some(dir) = &self.config_dir {
            return dir.clone();
        }

        if let Ok(current_dir) = std::env::current_dir() {
            if has_local_files(&current_dir) {
                return current_dir;
            }
        }

        if let Some(dir) = platform() {
            return dir.join("nutricam");
        }

        PathBuf::from(".")
    }
}

fn has_local_files(dir: &Path) -> bool {
    [SETTINGS_FILE, LOG_FILE].iter().any(|f| dir.join(f).exists())
}

// ===== Settings =====

/// User-editable connection settings.
///
/// The password is never written to disk; it comes from the CLI, the
/// environment or the console for each run.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub camera_ip: String,
    pub api_url: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub stream_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            camera_ip: DEFAULT_CAMERA_IP.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            email: String::new(),
            password: String::new(),
            stream_port: DEFAULT_STREAM_PORT,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("camera_ip", &self.camera_ip)
            .field("api_url", &self.api_url)
            .field("email", &self.email)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("stream_port", &self.stream_port)
            .finish()
    }
}

impl Settings {
    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse settings: {}", path.display()))?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("Failed to write settings: {}", path.display()))?;
        info!("Settings saved to {}", path.display());
        Ok(())
    }

    /// API base URL without a trailing slash
    pub fn api_base(&self) -> &str {
        self.api_url.trim().trim_end_matches('/')
    }

    /// Camera address without scheme or trailing slash
    pub fn camera_host(&self) -> &str {
        self.camera_ip
            .trim()
            .trim_start_matches("http://")
            .trim_end_matches('/')
    }
}

/// Trimmed `value`, or a user-facing "Please enter ..." message if blank
pub fn require_non_empty<'a>(value: &'a str, what: &str) -> std::result::Result<&'a str, String> {
    let value = value.trim();
    if value.is_empty() {
        Err(format!("Please enter {}", what))
    } else {
        Ok(value)
    }
}

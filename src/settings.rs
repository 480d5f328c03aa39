// TechCodex Cloud settings module
// Persistent non-secret configuration; secrets live in the credential store.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Cloud core settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root folder for downloads; each provider gets its own subfolder
    pub download_root: PathBuf,
    /// Loopback port for the OAuth2 redirect listener
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,
    /// Seconds to wait for the authorization redirect before giving up
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// Default listing page size (clamped per provider)
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Open the authorization URL in the system browser automatically
    #[serde(default = "default_true")]
    pub auto_open_browser: bool,
}

fn default_redirect_port() -> u16 {
    8080
}

fn default_auth_timeout_secs() -> u64 {
    120
}

fn default_page_size() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        // Default download root: <data dir>/TechCodex
        let download_root = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("TechCodex");

        Self {
            download_root,
            redirect_port: default_redirect_port(),
            auth_timeout_secs: default_auth_timeout_secs(),
            page_size: default_page_size(),
            auto_open_browser: default_true(),
        }
    }
}

impl Settings {
    /// Redirect URI derived from the configured loopback port
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/callback", self.redirect_port)
    }
}

/// Get the path to the settings file
fn settings_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
    config_dir.join("techcodex").join("cloud_settings.json")
}

/// Load settings from disk, falling back to defaults on any failure
pub fn load_settings() -> Settings {
    let path = settings_path();

    if path.exists() {
        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(settings) => return settings,
                Err(e) => {
                    tracing::warn!("Failed to parse cloud settings: {}", e);
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read cloud settings: {}", e);
            }
        }
    }

    Settings::default()
}

/// Save settings to disk
pub fn save_settings(settings: &Settings) -> Result<(), String> {
    let path = settings_path();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
    }

    let content = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;

    fs::write(&path, content).map_err(|e| format!("Failed to write settings: {}", e))?;

    tracing::info!("Cloud settings saved to {:?}", path);
    Ok(())
}

/// Validate settings before use
pub fn validate_settings(settings: &Settings) -> Result<(), String> {
    if settings.redirect_port == 0 {
        return Err("Redirect port must be fixed, not ephemeral".to_string());
    }
    if settings.auth_timeout_secs == 0 {
        return Err("Auth timeout cannot be zero".to_string());
    }
    if settings.page_size == 0 {
        return Err("Page size cannot be zero".to_string());
    }
    Ok(())
}

use std::path::PathBuf;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Target platform endpoints and markers
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Browser configuration
    #[serde(default)]
    pub browser: BrowserConfig,

    /// Timeouts, all in seconds unless noted
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Login page URL
    #[serde(default = "default_login_url")]
    pub login_url: String,

    /// Authenticated home feed URL, used by the proxy-routed validator
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// Cookie domain suffix the captured bundle is scoped to
    #[serde(default = "default_domain")]
    pub domain: String,

    /// The one cookie whose presence is the authoritative auth signal
    #[serde(default = "default_essential_cookie")]
    pub essential_cookie: String,

    /// Secondary session cookie; its absence is a warning, not a failure
    #[serde(default = "default_secondary_cookie")]
    pub secondary_cookie: String,

    /// Fewer trust-store cookies than this triggers a non-fatal warning
    #[serde(default = "default_min_cookie_count")]
    pub min_cookie_count: usize,

    /// Separator the platform uses in page titles ("Name | Platform")
    #[serde(default = "default_title_separator")]
    pub title_separator: String,

    /// Display name fallback when extraction fails
    #[serde(default = "default_display_name")]
    pub display_name_placeholder: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            feed_url: default_feed_url(),
            domain: default_domain(),
            essential_cookie: default_essential_cookie(),
            secondary_cookie: default_secondary_cookie(),
            min_cookie_count: default_min_cookie_count(),
            title_separator: default_title_separator(),
            display_name_placeholder: default_display_name(),
        }
    }
}

fn default_login_url() -> String {
    "https://www.linkedin.com/login".to_string()
}

fn default_feed_url() -> String {
    "https://www.linkedin.com/feed/".to_string()
}

fn default_domain() -> String {
    "linkedin.com".to_string()
}

fn default_essential_cookie() -> String {
    "li_at".to_string()
}

fn default_secondary_cookie() -> String {
    "JSESSIONID".to_string()
}

fn default_min_cookie_count() -> usize {
    5
}

fn default_title_separator() -> String {
    " | ".to_string()
}

fn default_display_name() -> String {
    "Member".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Browser executable path (overrides auto-discovery)
    pub executable: Option<String>,

    /// Known-good fallback paths tried after `which` lookup fails
    #[serde(default = "default_fallback_paths")]
    pub fallback_paths: Vec<String>,

    /// Run headless
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Fixed window size presented to the platform
    #[serde(default = "default_window_width")]
    pub window_width: u32,

    #[serde(default = "default_window_height")]
    pub window_height: u32,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            fallback_paths: default_fallback_paths(),
            headless: default_headless(),
            window_width: default_window_width(),
            window_height: default_window_height(),
        }
    }
}

fn default_fallback_paths() -> Vec<String> {
    vec![
        "/usr/bin/google-chrome".to_string(),
        "/usr/bin/google-chrome-stable".to_string(),
        "/usr/bin/chromium".to_string(),
        "/usr/bin/chromium-browser".to_string(),
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome".to_string(),
    ]
}

fn default_headless() -> bool {
    true
}

fn default_window_width() -> u32 {
    1920
}

fn default_window_height() -> u32 {
    1080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Hard cap on a whole login session, including the 2FA wait
    #[serde(default = "default_session_cap")]
    pub session_cap_secs: u64,

    /// Per-navigation timeout when a proxy is in use
    #[serde(default = "default_navigation")]
    pub navigation_secs: u64,

    /// Longer navigation timeout for the single direct-connection retry
    #[serde(default = "default_fallback_navigation")]
    pub fallback_navigation_secs: u64,

    /// Grace delay after credential submit when no navigation event fires
    #[serde(default = "default_submit_grace")]
    pub submit_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            session_cap_secs: default_session_cap(),
            navigation_secs: default_navigation(),
            fallback_navigation_secs: default_fallback_navigation(),
            submit_grace_ms: default_submit_grace(),
        }
    }
}

fn default_session_cap() -> u64 {
    300
}

fn default_navigation() -> u64 {
    30
}

fn default_fallback_navigation() -> u64 {
    60
}

fn default_submit_grace() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            platform: PlatformConfig::default(),
            browser: BrowserConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from all sources (file, env, defaults)
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let config: Config = Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Config::default()))
            // Merge config file if exists
            .merge(Toml::file(&config_path))
            // Merge environment variables (SESSIONFORGE_*)
            .merge(Env::prefixed("SESSIONFORGE_").split("_"))
            .extract()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Get the configuration file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sessionforge")
            .join("config.toml")
    }

    /// Browser executable with `~` expanded, if configured
    pub fn browser_executable(&self) -> Option<PathBuf> {
        self.browser
            .executable
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
    }
}

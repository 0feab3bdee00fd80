//! keystat
//!
//! A concurrent browser-automation engine that collects keyword
//! search-frequency statistics from a web analytics service: proxy leasing,
//! multi-tab sessions over the Chrome DevTools Protocol, response
//! correlation and charset-tolerant decoding, adaptive pacing, and
//! persisted login state per account.

pub mod account;
pub mod auth;
pub mod decode;
pub mod error;
pub mod proxy;
pub mod rate;
pub mod scrape;
pub mod session;
pub mod site;
pub mod stats;
pub mod worker;

use std::path::PathBuf;
use tracing::{error, info, warn};

pub use error::ScrapeError;
pub use scrape::{
    null_sink, EventSink, ProxyPolicy, ScrapeEngine, ScrapeEvent, ScrapeRequest,
};
pub use session::LaunchMode;
pub use worker::QueryResult;

use rate::RateConfig;
use site::SiteAdapter;
use worker::WorkerConfig;

/// Engine configuration, persisted as JSON under the user config dir.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScraperConfig {
    pub headless: bool,
    /// Explicit Chrome binary; auto-detected when absent
    pub chrome_path: Option<PathBuf>,
    /// How long to wait for a logged-in marker after navigation
    pub auth_wait_secs: u64,
    /// Interval between progress events
    pub progress_interval_secs: u64,
    pub site: SiteAdapter,
    pub rate: RateConfig,
    pub worker: WorkerConfig,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            auth_wait_secs: 8,
            progress_interval_secs: 5,
            site: SiteAdapter::default(),
            rate: RateConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("keystat").join("logs"))
}

impl ScraperConfig {
    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("keystat").join("config.json"))
    }

    /// Load config from file
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(config) => {
                            info!("Loaded config from {:?}", path);
                            return config;
                        }
                        Err(e) => {
                            warn!("Failed to parse config file: {}", e);
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read config file: {}", e);
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to file
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create config directory: {}", e);
                    return;
                }
            }

            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("Failed to save config: {}", e);
                    } else {
                        info!("Config saved to {:?}", path);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize config: {}", e);
                }
            }
        }
    }
}

/// Initialize logging: console plus a daily-rolling file when a log
/// directory is available.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "keystat.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trips_through_json() {
        let config = ScraperConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ScraperConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.worker.tab_count, config.worker.tab_count);
        assert_eq!(back.site.base_url, config.site.base_url);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let back: ScraperConfig = serde_json::from_str(r#"{"headless":false}"#).unwrap();
        assert!(!back.headless);
        assert_eq!(back.auth_wait_secs, ScraperConfig::default().auth_wait_secs);
    }
}

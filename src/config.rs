//! Terminal configuration.
//!
//! Everything the engine needs to reach the transaction API and place its
//! local state, loadable from environment variables with sane defaults so a
//! dev terminal runs with zero setup.

use std::path::PathBuf;
use std::time::Duration;

/// Default transaction API base, matching the backend's dev port.
const DEFAULT_API_URL: &str = "http://localhost:5001";

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the transaction API (no trailing slash, no `/api`).
    pub api_base_url: String,
    /// Directory holding the local queue database and logs.
    pub data_dir: PathBuf,
    /// Timeout for regular API requests.
    pub request_timeout: Duration,
    /// Timeout for the lightweight connectivity probe.
    pub probe_timeout: Duration,
    /// Background sync loop interval.
    pub sync_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_base_url: DEFAULT_API_URL.to_string(),
            data_dir: PathBuf::from("loop-pos-data"),
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
        }
    }
}

impl Config {
    /// Load config from `LOOP_POS_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Ok(url) = std::env::var("LOOP_POS_API_URL") {
            if !url.trim().is_empty() {
                cfg.api_base_url = normalize_base_url(&url);
            }
        }
        if let Ok(dir) = std::env::var("LOOP_POS_DATA_DIR") {
            if !dir.trim().is_empty() {
                cfg.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(secs) = std::env::var("LOOP_POS_SYNC_INTERVAL_SECS") {
            if let Ok(parsed) = secs.trim().parse::<u64>() {
                if parsed > 0 {
                    cfg.sync_interval = Duration::from_secs(parsed);
                }
            }
        }

        cfg
    }
}

/// Normalise an API base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ===========================================================================
// Tests
// ===========================================================================

//! Runtime configuration
//!
//! Defaults match the reference deployment. Values are layered: defaults,
//! then an optional JSON file, then `FEID_*` environment variables (after
//! `.env` is loaded), then CLI flags applied by `main`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "feid.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: PathBuf,
    /// Worker threads for parallel column computation
    pub workers: usize,
    /// Cap on an event window when the entity has no duration column
    pub max_window_hours: i64,
    /// Longest window or event duration taken at face value; longer ones
    /// come from corrupt times
    pub max_span_hours: i64,
    /// Bound on hour offsets in reference points and `shift`
    pub max_hour_offset: i64,
    /// Bound on event offsets (±N events)
    pub max_event_offset: i32,
    /// How long an interactive row recompute blocks before answering "not done"
    pub row_timeout_ms: u64,
    /// De-trended series windows reach this many hours before their start
    pub detrend_extension_hours: i64,
    /// Averaged values are missing when more than `n / divisor` hours are gaps
    pub avg_missing_divisor: usize,
    /// Series names that get the de-trending pre-pass
    pub detrended_series: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            workers: 4,
            max_window_hours: 48,
            max_span_hours: 720,
            max_hour_offset: 72,
            max_event_offset: 4,
            row_timeout_ms: 3000,
            detrend_extension_hours: 2,
            avg_missing_divisor: 2,
            detrended_series: vec!["a0".to_string(), "a0m".to_string()],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
}

impl Config {
    /// Load config from an optional JSON file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("FEID_DB") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = env_parse("FEID_WORKERS")? {
            self.workers = v;
        }
        if let Some(v) = env_parse("FEID_MAX_WINDOW_HOURS")? {
            self.max_window_hours = v;
        }
        if let Some(v) = env_parse("FEID_MAX_SPAN_HOURS")? {
            self.max_span_hours = v;
        }
        if let Some(v) = env_parse("FEID_MAX_HOUR_OFFSET")? {
            self.max_hour_offset = v;
        }
        if let Some(v) = env_parse("FEID_MAX_EVENT_OFFSET")? {
            self.max_event_offset = v;
        }
        if let Some(v) = env_parse("FEID_ROW_TIMEOUT_MS")? {
            self.row_timeout_ms = v;
        }
        Ok(())
    }

    pub fn row_timeout(&self) -> Duration {
        Duration::from_millis(self.row_timeout_ms)
    }

    pub fn is_detrended(&self, series: &str) -> bool {
        self.detrended_series.iter().any(|s| s == series)
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
        Err(_) => Ok(None),
    }
}

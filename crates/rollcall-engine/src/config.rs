use rollcall_core::{DedupPolicy, DEFAULT_MATCH_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Engine configuration.
///
/// Layered as: built-in defaults, then the TOML file named by
/// `ROLLCALL_CONFIG` (if set), then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance below which a probe matches, in [0, 1].
    pub match_threshold: f32,
    /// Confidence above which a match is offered for confirmation.
    pub confirm_confidence: f32,
    /// Dedup window for attendance records.
    pub dedup_policy: DedupPolicy,
    /// Samples captured per enrollment when the caller does not say.
    pub enroll_target_samples: usize,
    /// Minimum gap between two accepted enrollment samples.
    pub enroll_min_interval_ms: u64,
    /// Bound on any single store operation.
    pub store_timeout_secs: u64,
    /// Where accepted enrollment frames are archived, if anywhere.
    pub samples_dir: Option<PathBuf>,
    /// Capacity of the recognition event channel.
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("attendance.db"),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            confirm_confidence: 70.0,
            dedup_policy: DedupPolicy::Session,
            enroll_target_samples: 5,
            enroll_min_interval_ms: 1000,
            store_timeout_secs: 10,
            samples_dir: None,
            event_buffer: 32,
        }
    }
}

impl Config {
    /// Load the full layered configuration for this process.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        Ok(base.with_env(|key| std::env::var(key).ok()).validated())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `ROLLCALL_*` overrides read through `lookup`.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_SAMPLES_DIR") {
            self.samples_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("ROLLCALL_DEDUP_POLICY") {
            match v.parse() {
                Ok(policy) => self.dedup_policy = policy,
                Err(e) => tracing::warn!(error = %e, "ignoring ROLLCALL_DEDUP_POLICY"),
            }
        }
        self.match_threshold = parsed(&lookup, "ROLLCALL_MATCH_THRESHOLD", self.match_threshold);
        self.confirm_confidence =
            parsed(&lookup, "ROLLCALL_CONFIRM_CONFIDENCE", self.confirm_confidence);
        self.enroll_target_samples =
            parsed(&lookup, "ROLLCALL_ENROLL_TARGET_SAMPLES", self.enroll_target_samples);
        self.enroll_min_interval_ms =
            parsed(&lookup, "ROLLCALL_ENROLL_MIN_INTERVAL_MS", self.enroll_min_interval_ms);
        self.store_timeout_secs =
            parsed(&lookup, "ROLLCALL_STORE_TIMEOUT_SECS", self.store_timeout_secs);
        self.event_buffer = parsed(&lookup, "ROLLCALL_EVENT_BUFFER", self.event_buffer);
        self
    }

    /// Replace out-of-range values with their defaults.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        if !(0.0..=1.0).contains(&self.match_threshold) {
            tracing::warn!(
                value = self.match_threshold,
                default = defaults.match_threshold,
                "match_threshold outside [0, 1]; using default"
            );
            self.match_threshold = defaults.match_threshold;
        }
        if !(0.0..=100.0).contains(&self.confirm_confidence) {
            tracing::warn!(value = self.confirm_confidence, "confirm_confidence outside [0, 100]; using default");
            self.confirm_confidence = defaults.confirm_confidence;
        }
        if self.enroll_target_samples == 0 {
            tracing::warn!("enroll_target_samples must be positive; using default");
            self.enroll_target_samples = defaults.enroll_target_samples;
        }
        if self.store_timeout_secs == 0 {
            tracing::warn!("store_timeout_secs must be positive; using default");
            self.store_timeout_secs = defaults.store_timeout_secs;
        }
        if self.event_buffer == 0 {
            self.event_buffer = defaults.event_buffer;
        }
        self
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn enroll_min_interval(&self) -> Duration {
        Duration::from_millis(self.enroll_min_interval_ms)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match lookup(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable value; keeping previous setting");
            current
        }),
        None => current,
    }
}

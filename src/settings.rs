use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Exponential;
use crate::error::{Error, Result};

/// Capacity of the entry queue and of every inter-stage queue.
pub const BUFFER_SIZE: usize = 32;

const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// What the dispatcher does with a result nobody registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedPolicy {
    #[default]
    Discard,
    Broadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_interval_ms: u32,
    pub max_interval_ms: u32,
    pub factor: f64,
    /// 0.0 - 1.0
    pub jitter: f64,
    /// Retries after the first attempt. Once spent the stream fails.
    pub max_attempts: u16,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_interval_ms: 250,
            max_interval_ms: 10_000,
            factor: 2.0,
            jitter: 0.2,
            max_attempts: 8,
        }
    }
}

impl RetrySettings {
    pub fn backoff(&self) -> Exponential {
        Exponential::from_millis(
            self.base_interval_ms,
            self.max_interval_ms,
            self.factor,
            self.jitter,
            Some(self.max_attempts),
        )
    }
}

/// Per-stream settings. Built once and handed to every stage at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub run_id: String,
    pub project: Option<String>,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Records are persisted locally but never transmitted.
    pub offline: bool,
    pub sync_dir: PathBuf,
    pub buffer_size: usize,
    /// Transmit one stats record out of every N (`always_send` bypasses this).
    pub stats_sample_every: u32,
    /// Config/summary updates merged by the sender before an upsert goes out.
    pub summary_batch_size: usize,
    pub http_timeout_ms: u64,
    pub retry: RetrySettings,
    pub unmatched_responses: UnmatchedPolicy,
    pub show_footer: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().simple().to_string(),
            project: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            offline: false,
            sync_dir: std::env::temp_dir().join("nexus-stream"),
            buffer_size: BUFFER_SIZE,
            stats_sample_every: 1,
            summary_batch_size: 16,
            http_timeout_ms: 10_000,
            retry: RetrySettings::default(),
            unmatched_responses: UnmatchedPolicy::default(),
            show_footer: true,
        }
    }
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        let settings: Settings = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("parsing {}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Applies `NEXUS_*` environment overrides on top of the loaded values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("NEXUS_BASE_URL") {
            self.base_url = url;
        }
        if let Ok(key) = std::env::var("NEXUS_API_KEY") {
            self.api_key = Some(key);
        }
        if let Ok(id) = std::env::var("NEXUS_RUN_ID") {
            self.run_id = id;
        }
        if let Ok(mode) = std::env::var("NEXUS_MODE") {
            self.offline = mode.eq_ignore_ascii_case("offline");
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.run_id.is_empty() {
            return Err(Error::Config("run_id must not be empty".into()));
        }
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be at least 1".into()));
        }
        if self.stats_sample_every == 0 {
            return Err(Error::Config("stats_sample_every must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::Config("retry.jitter must be within 0.0 - 1.0".into()));
        }
        Ok(())
    }

    pub fn log_path(&self) -> PathBuf {
        self.sync_dir.join(format!("run-{}.nexus", self.run_id))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.buffer_size, BUFFER_SIZE);
        assert_eq!(settings.unmatched_responses, UnmatchedPolicy::Discard);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"run_id": "abc", "offline": true, "retry": {"max_attempts": 2}}"#)
                .unwrap();
        assert_eq!(settings.run_id, "abc");
        assert!(settings.offline);
        assert_eq!(settings.retry.max_attempts, 2);
        assert_eq!(settings.retry.factor, 2.0);
        assert!(settings.log_path().ends_with("run-abc.nexus"));
    }

    #[test]
    fn test_rejects_zero_buffer() {
        let settings = Settings {
            buffer_size: 0,
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }
}

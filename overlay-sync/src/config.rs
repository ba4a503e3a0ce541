//! Runtime settings read from `OVERLAY_*` environment variables. Loading a
//! `.env` file is left to the binary.

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long a confirmed overlay keeps precedence over snapshots
    pub staleness_window: Duration,
    /// Fixed delay before the single transient retry
    pub retry_delay: Duration,
    /// Quiet period for debounced saves without a per-class override
    pub debounce_default: Duration,
    /// Quiet period per key class (key text before the first ':')
    pub debounce_overrides: HashMap<String, Duration>,
    /// Default interval for poll-driven invalidation
    pub poll_interval: Duration,
    /// Root URL of the remote data service
    pub api_base_url: String,
    /// Static bearer credential, if configured
    pub api_token: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_millis(1500),
            retry_delay: Duration::from_millis(300),
            debounce_default: Duration::from_millis(1500),
            debounce_overrides: HashMap::new(),
            poll_interval: Duration::from_millis(15_000),
            api_base_url: "http://localhost:8080".to_string(),
            api_token: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            staleness_window: Duration::from_millis(env_parse(
                "OVERLAY_STALENESS_WINDOW_MS",
                1500,
            )?),
            retry_delay: Duration::from_millis(env_parse("OVERLAY_RETRY_DELAY_MS", 300)?),
            debounce_default: Duration::from_millis(env_parse("OVERLAY_DEBOUNCE_MS", 1500)?),
            debounce_overrides: env_durations("OVERLAY_DEBOUNCE_OVERRIDES")?,
            poll_interval: Duration::from_millis(
                env_parse("OVERLAY_POLL_INTERVAL_MS", 15_000u64)?.max(100),
            ),
            api_base_url: env_str("OVERLAY_API_BASE_URL", &defaults.api_base_url),
            api_token: std::env::var("OVERLAY_API_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
        })
    }

    /// Name a quiet period for one key class (builder pattern)
    pub fn with_debounce(mut self, class: impl Into<String>, quiet: Duration) -> Self {
        self.debounce_overrides.insert(class.into(), quiet);
        self
    }

    /// Quiet period for a scheduler key such as `report:42:draft`
    pub fn debounce_for(&self, key: &str) -> Duration {
        let class = key.split(':').next().unwrap_or(key);
        self.debounce_overrides
            .get(class)
            .copied()
            .unwrap_or(self.debounce_default)
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_durations(key: &str) -> anyhow::Result<HashMap<String, Duration>> {
    match std::env::var(key) {
        Ok(raw) => parse_durations(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={raw}: {e}")),
        Err(_) => Ok(HashMap::new()),
    }
}

/// Parse `class=ms,class=ms`.
fn parse_durations(raw: &str) -> Result<HashMap<String, Duration>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (class, ms) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected class=ms, got '{pair}'"))?;
            let ms = ms
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("bad duration for '{class}': {e}"))?;
            Ok((class.trim().to_string(), Duration::from_millis(ms)))
        })
        .collect()
}

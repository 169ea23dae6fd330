//! Configuration module for mcpaas
//!
//! All runtime tuning comes from `MCPAAS_*` environment variables; CLI flags
//! layer on top of them. There is no configuration file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Listen host
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of concurrently running child servers
    #[serde(default = "default_max_children")]
    pub max_children: usize,
    /// Idle threshold after which a subscriber-less child is reaped
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Reaper tick interval
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    /// SSE keepalive ping period
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Hard cap on a single SSE session
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// Timeout for each outbound registry probe
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Post-spawn settle delay applied on the SSE path for fresh children.
    /// Zero disables the delay entirely.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// npm quality gate: minimum downloads over the last month
    #[serde(default = "default_min_monthly_downloads")]
    pub min_monthly_downloads: u64,
    /// PyPI quality gate: maximum age of the newest release
    #[serde(default = "default_max_release_age_days")]
    pub max_release_age_days: i64,
    /// PyPI quality gate: minimum description length
    #[serde(default = "default_min_description_len")]
    pub min_description_len: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_max_children() -> usize {
    10
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

fn default_reap_interval_secs() -> u64 {
    5 * 60
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_session_timeout_secs() -> u64 {
    30 * 60
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_settle_ms() -> u64 {
    2000
}

fn default_min_monthly_downloads() -> u64 {
    100
}

fn default_max_release_age_days() -> i64 {
    365
}

fn default_min_description_len() -> usize {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_children: default_max_children(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            keepalive_secs: default_keepalive_secs(),
            session_timeout_secs: default_session_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            settle_ms: default_settle_ms(),
            min_monthly_downloads: default_min_monthly_downloads(),
            max_release_age_days: default_max_release_age_days(),
            min_description_len: default_min_description_len(),
        }
    }
}

impl Config {
    /// Build a configuration from `MCPAAS_*` environment variables.
    /// Unset or unparsable variables fall back to the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(host) = env_var("MCPAAS_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("MCPAAS_PORT") {
            config.port = port;
        }
        if let Some(max) = env_parse("MCPAAS_MAX_CHILDREN") {
            config.max_children = max;
        }
        if let Some(secs) = env_parse("MCPAAS_IDLE_TIMEOUT_SECS") {
            config.idle_timeout_secs = secs;
        }
        if let Some(secs) = env_parse("MCPAAS_REAP_INTERVAL_SECS") {
            config.reap_interval_secs = secs;
        }
        if let Some(secs) = env_parse("MCPAAS_KEEPALIVE_SECS") {
            config.keepalive_secs = secs;
        }
        if let Some(secs) = env_parse("MCPAAS_SESSION_TIMEOUT_SECS") {
            config.session_timeout_secs = secs;
        }
        if let Some(secs) = env_parse("MCPAAS_PROBE_TIMEOUT_SECS") {
            config.probe_timeout_secs = secs;
        }
        if let Some(ms) = env_parse("MCPAAS_SETTLE_MS") {
            config.settle_ms = ms;
        }
        if let Some(n) = env_parse("MCPAAS_MIN_MONTHLY_DOWNLOADS") {
            config.min_monthly_downloads = n;
        }
        if let Some(days) = env_parse("MCPAAS_MAX_RELEASE_AGE_DAYS") {
            config.max_release_age_days = days;
        }
        if let Some(len) = env_parse("MCPAAS_MIN_DESCRIPTION_LEN") {
            config.min_description_len = len;
        }

        config
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}

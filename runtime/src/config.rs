//! Runtime configuration resolved from `NUTRISCAN_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/nutriscan.sock";

/// Timers, retry budgets and paths used by the coordinator, page agents
/// and the batch orchestrator.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Records with no activity for this long are swept.
    pub inactivity_threshold: Duration,
    pub sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    pub probe_attempts: u32,
    /// Delay before the first readiness probe.
    pub probe_delay_min: Duration,
    /// Delay before the last readiness probe.
    pub probe_delay_max: Duration,
    pub relay_timeout: Duration,
    /// How long the agent waits for the preview write before responding anyway.
    pub persist_timeout: Duration,
    pub register_timeout: Duration,
    pub register_retries: u32,
    pub register_retry_delay: Duration,
    /// Extra coordinator-level attempts in `Coordinator::request`.
    pub request_retries: u32,
    pub page_load_timeout: Duration,
    pub settle_delay: Duration,
    pub batch_retries: u32,
    pub batch_retry_delay: Duration,
    pub label_duration: Duration,
    pub log_cap: usize,
    pub state_dir: PathBuf,
    pub socket_path: PathBuf,
    /// Replacement locator file, when set.
    pub locators: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            inactivity_threshold: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(20),
            probe_attempts: 5,
            probe_delay_min: Duration::from_millis(500),
            probe_delay_max: Duration::from_millis(1000),
            relay_timeout: Duration::from_secs(5),
            persist_timeout: Duration::from_secs(2),
            register_timeout: Duration::from_secs(2),
            register_retries: 3,
            register_retry_delay: Duration::from_secs(2),
            request_retries: 2,
            page_load_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(2),
            batch_retries: 3,
            batch_retry_delay: Duration::from_secs(2),
            label_duration: nutriscan::DEFAULT_LABEL_DURATION,
            log_cap: 1000,
            state_dir: default_state_dir(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            locators: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            inactivity_threshold: read_env_secs("NUTRISCAN_INACTIVITY_SECS", d.inactivity_threshold),
            sweep_interval: read_env_secs("NUTRISCAN_SWEEP_SECS", d.sweep_interval).max(Duration::from_secs(1)),
            heartbeat_interval: read_env_secs("NUTRISCAN_HEARTBEAT_SECS", d.heartbeat_interval)
                .max(Duration::from_secs(1)),
            probe_attempts: read_env_u32("NUTRISCAN_PROBE_ATTEMPTS", d.probe_attempts).max(1),
            probe_delay_min: read_env_millis("NUTRISCAN_PROBE_DELAY_MIN_MS", d.probe_delay_min),
            probe_delay_max: read_env_millis("NUTRISCAN_PROBE_DELAY_MAX_MS", d.probe_delay_max),
            relay_timeout: read_env_millis("NUTRISCAN_RELAY_TIMEOUT_MS", d.relay_timeout),
            persist_timeout: read_env_millis("NUTRISCAN_PERSIST_TIMEOUT_MS", d.persist_timeout),
            register_timeout: read_env_millis("NUTRISCAN_REGISTER_TIMEOUT_MS", d.register_timeout),
            register_retries: read_env_u32("NUTRISCAN_REGISTER_RETRIES", d.register_retries),
            register_retry_delay: read_env_millis(
                "NUTRISCAN_REGISTER_RETRY_DELAY_MS",
                d.register_retry_delay,
            ),
            request_retries: read_env_u32("NUTRISCAN_REQUEST_RETRIES", d.request_retries),
            page_load_timeout: read_env_millis("NUTRISCAN_PAGE_LOAD_TIMEOUT_MS", d.page_load_timeout),
            settle_delay: read_env_millis("NUTRISCAN_SETTLE_DELAY_MS", d.settle_delay),
            batch_retries: read_env_u32("NUTRISCAN_BATCH_RETRIES", d.batch_retries),
            batch_retry_delay: read_env_millis("NUTRISCAN_BATCH_RETRY_DELAY_MS", d.batch_retry_delay),
            label_duration: read_env_millis("NUTRISCAN_LABEL_DURATION_MS", d.label_duration),
            log_cap: read_env_usize("NUTRISCAN_LOG_CAP", d.log_cap).max(1),
            state_dir: read_env_string("NUTRISCAN_STATE_DIR")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or(d.state_dir),
            socket_path: read_env_string("NUTRISCAN_SOCKET")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or(d.socket_path),
            locators: read_env_string("NUTRISCAN_LOCATORS")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Delay before probe `attempt` (zero-based), rising linearly from the
    /// minimum to the maximum over the configured attempts.
    pub fn probe_delay(&self, attempt: u32) -> Duration {
        let min = self.probe_delay_min.as_millis() as u64;
        let max = (self.probe_delay_max.as_millis() as u64).max(min);
        let steps = self.probe_attempts.saturating_sub(1).max(1) as u64;
        let step = (max - min) / steps;
        Duration::from_millis((min + step * attempt as u64).min(max))
    }

    /// Locator configuration: the override file when set, else the built-in set.
    pub fn load_locators(&self) -> nutriscan::EngineResult<nutriscan::LocatorConfig> {
        match &self.locators {
            Some(path) => nutriscan::LocatorConfig::from_path(path),
            None => nutriscan::LocatorConfig::builtin(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nutriscan")
}

fn read_env_secs(name: &str, default_value: Duration) -> Duration {
    Duration::from_secs(read_env_u64(name, default_value.as_secs()))
}

fn read_env_millis(name: &str, default_value: Duration) -> Duration {
    Duration::from_millis(read_env_u64(name, default_value.as_millis() as u64))
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_u32(name: &str, default_value: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default_value)
}

fn read_env_usize(name: &str, default_value: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default_value)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_delays_rise_to_max() {
        let cfg = RuntimeConfig::default();
        let delays: Vec<u64> = (0..cfg.probe_attempts)
            .map(|i| cfg.probe_delay(i).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 625, 750, 875, 1000]);
    }

    #[test]
    fn test_single_probe_uses_min_delay() {
        let cfg = RuntimeConfig {
            probe_attempts: 1,
            ..RuntimeConfig::default()
        };
        assert_eq!(cfg.probe_delay(0), Duration::from_millis(500));
    }

    #[test]
    fn test_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.inactivity_threshold, Duration::from_secs(30));
        assert_eq!(cfg.relay_timeout, Duration::from_secs(5));
        assert_eq!(cfg.log_cap, 1000);
        assert!(cfg.state_dir.ends_with(".nutriscan"));
    }
}

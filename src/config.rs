//! Node configuration, defaulted from the crate constants and overridable
//! through `MAPRING_*` environment variables.
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::consts;
use crate::error::Error;
use crate::error::Result;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub request_timeout_ms: u64,
    pub max_task_timeout_ms: u64,
    pub items_per_chunk: usize,
    pub replication: usize,
    pub successor_list_len: usize,
    pub stabilize_period_ms: u64,
    pub fix_fingers_period_ms: u64,
    pub check_predecessor_period_ms: u64,
    pub max_task_attempts: u32,
    /// Per-job cap on bytes written into the ring. `None` means unbounded.
    pub memory_cap: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout_ms: consts::REQUEST_TIMEOUT_MS,
            max_task_timeout_ms: consts::MAX_TASK_TIMEOUT_MS,
            items_per_chunk: consts::ITEMS_PER_CHUNK,
            replication: consts::DHT_REPLICATION_SIZE,
            successor_list_len: consts::SUCCESSOR_LIST_LEN,
            stabilize_period_ms: consts::STABILIZE_PERIOD_MS,
            fix_fingers_period_ms: consts::FIX_FINGERS_PERIOD_MS,
            check_predecessor_period_ms: consts::CHECK_PREDECESSOR_PERIOD_MS,
            max_task_attempts: consts::MAX_TASK_ATTEMPTS,
            memory_cap: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

impl Config {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            request_timeout_ms: env_parse("MAPRING_REQUEST_TIMEOUT_MS", d.request_timeout_ms),
            max_task_timeout_ms: env_parse("MAPRING_MAX_TASK_TIMEOUT_MS", d.max_task_timeout_ms),
            items_per_chunk: env_parse("MAPRING_ITEMS_PER_CHUNK", d.items_per_chunk),
            replication: env_parse("MAPRING_REPLICATION", d.replication),
            successor_list_len: env_parse("MAPRING_SUCCESSOR_LIST_LEN", d.successor_list_len),
            stabilize_period_ms: env_parse("MAPRING_STABILIZE_PERIOD_MS", d.stabilize_period_ms),
            fix_fingers_period_ms: env_parse(
                "MAPRING_FIX_FINGERS_PERIOD_MS",
                d.fix_fingers_period_ms,
            ),
            check_predecessor_period_ms: env_parse(
                "MAPRING_CHECK_PREDECESSOR_PERIOD_MS",
                d.check_predecessor_period_ms,
            ),
            max_task_attempts: env_parse("MAPRING_MAX_TASK_ATTEMPTS", d.max_task_attempts),
            memory_cap: std::env::var("MAPRING_MEMORY_CAP")
                .ok()
                .and_then(|raw| raw.parse().ok()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication == 0 {
            return Err(Error::InvalidConfig("replication must be >= 1".into()));
        }
        if self.successor_list_len < self.replication {
            return Err(Error::InvalidConfig(format!(
                "successor list length {} is below the replication size {}",
                self.successor_list_len, self.replication
            )));
        }
        if self.request_timeout_ms == 0 || self.max_task_timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        if self.items_per_chunk == 0 {
            return Err(Error::InvalidConfig("items per chunk must be >= 1".into()));
        }
        if self.max_task_attempts == 0 {
            return Err(Error::InvalidConfig("task attempts must be >= 1".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stabilize_period(&self) -> Duration {
        Duration::from_millis(self.stabilize_period_ms)
    }

    pub fn fix_fingers_period(&self) -> Duration {
        Duration::from_millis(self.fix_fingers_period_ms)
    }

    pub fn check_predecessor_period(&self) -> Duration {
        Duration::from_millis(self.check_predecessor_period_ms)
    }
}

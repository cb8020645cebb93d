// ABOUTME: Tunables for the engine pool, analysis scheduler and health monitor
//
// Defines the three configuration sections consumed by the orchestrator:
// - PoolConfig: restart policy, handshake and termination timeouts
// - SchedulerConfig: queue depth limit and request/aggregate deadlines
// - HealthConfig: probe interval and probe round-trip timeout
//
// Durations are written as milliseconds in TOML (`*_ms` keys).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Restart and lifecycle tunables for engine slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum restart attempts before a slot is marked permanently failed
    pub restart_retry_limit: u32,

    /// Upper bound on one restart attempt (launch + handshake + configure)
    #[serde(rename = "restart_timeout_ms", with = "duration_ms")]
    pub restart_timeout: Duration,

    /// Initial restart delay (exponential backoff base)
    #[serde(rename = "restart_backoff_base_ms", with = "duration_ms")]
    pub restart_backoff_base: Duration,

    /// Maximum restart delay (exponential backoff cap)
    #[serde(rename = "restart_backoff_max_ms", with = "duration_ms")]
    pub restart_backoff_max: Duration,

    /// Time allowed for `uci` → `uciok` and `isready` → `readyok` exchanges
    #[serde(rename = "handshake_timeout_ms", with = "duration_ms")]
    pub handshake_timeout: Duration,

    /// Slack added to a time budget before a search is declared hung
    #[serde(rename = "search_grace_ms", with = "duration_ms")]
    pub search_grace: Duration,

    /// Wait between SIGTERM and force kill
    #[serde(rename = "terminate_grace_ms", with = "duration_ms")]
    pub terminate_grace: Duration,

    /// A process exiting within this window after spawn is a launch failure
    #[serde(rename = "launch_probe_ms", with = "duration_ms")]
    pub launch_probe: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            restart_retry_limit: 3,
            restart_timeout: Duration::from_secs(60),
            restart_backoff_base: Duration::from_millis(500),
            restart_backoff_max: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            search_grace: Duration::from_secs(5),
            terminate_grace: Duration::from_secs(2),
            launch_probe: Duration::from_millis(100),
        }
    }
}

/// Queueing and deadline tunables for the analysis scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum waiting entries per engine queue
    pub max_queue_depth: usize,

    /// Wall-clock limit for a node- or depth-bounded search
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,

    /// Overall deadline after which unfinished engines are reported timed-out
    #[serde(rename = "aggregate_deadline_ms", with = "duration_ms")]
    pub aggregate_deadline: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 32,
            request_timeout: Duration::from_secs(120),
            aggregate_deadline: Duration::from_secs(180),
        }
    }
}

/// Health probe tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between probe cycles
    #[serde(rename = "probe_interval_ms", with = "duration_ms")]
    pub probe_interval: Duration,

    /// Time allowed for the `isready` round-trip
    #[serde(rename = "probe_timeout_ms", with = "duration_ms")]
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Serde helper for Duration as milliseconds (u64)
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Truncate to u64 - configured durations are far below u64::MAX millis
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// ABOUTME: Health monitoring for the engine pool with configurable probe intervals
// ABOUTME: Background task that checks liveness, pings idle engines, triggers restarts and reports readiness

//! Health monitoring for the engine pool.
//!
//! The `HealthMonitor` runs as a background task that, every probe interval:
//! - checks `is_alive()` on every engine slot without blocking
//! - sends an `isready` round-trip to idle Ready sessions to catch engines
//!   that are alive but hung
//! - restarts dead or unresponsive slots through the pool's restart path
//! - publishes a `HealthReport` for the readiness probe
//!
//! Slots whose lock is held (a worker is searching or a restart is running)
//! get the liveness check only; the worker notices a dead process on its next
//! read and restarts it itself.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    HealthMonitor                        │
//! │                                                         │
//! │  ┌──────────────┐    ┌──────────────┐                  │
//! │  │ Check Loop   │───▶│ Slot probes  │                  │
//! │  │ (interval)   │    │ alive + ping │                  │
//! │  └──────────────┘    └──────────────┘                  │
//! │          │                   │                         │
//! │          │                   ▼                         │
//! │          │           ┌──────────────┐                  │
//! │          │           │ Restart on   │                  │
//! │          │           │   Failure    │                  │
//! │          │           └──────────────┘                  │
//! │          ▼                                              │
//! │  ┌──────────────┐                                      │
//! │  │ HealthReport │ ◀── readiness probe                  │
//! │  └──────────────┘                                      │
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::HealthConfig;
use super::descriptor::EngineKind;
use super::metrics::MetricsSnapshot;
use super::pool::{EngineHandle, EnginePool, EngineSlot, SlotStatus};
use super::protocol::SessionState;

// === Readiness ===

/// Overall readiness of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// Every enabled engine is serving or recovering
    Healthy,
    /// At least one engine serves, at least one is permanently failed
    Degraded,
    /// No engine serves
    Down,
}

impl Readiness {
    /// Whether the service can answer requests at all
    #[must_use]
    pub const fn is_serving(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Lowercase label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }
}

impl std::fmt::Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// === Reports ===

/// Health of one engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineHealth {
    /// Engine name
    pub name: String,
    /// Engine kind
    pub kind: EngineKind,
    /// Whether the engine is configured to run
    pub enabled: bool,
    /// At least one slot can take a search
    pub ready: bool,
    /// Slot state label (`ready`, `busy`, `failed`, ...)
    pub state: String,
    /// Restarts across all slots
    pub restarts: u32,
    /// Searches running now
    pub in_flight: u32,
    /// Entries waiting in the queue
    pub queue_depth: usize,
    /// Why the engine cannot serve
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EngineHealth {
    fn from_handle(handle: &EngineHandle) -> Self {
        Self {
            name: handle.name().to_string(),
            kind: handle.descriptor().kind,
            enabled: handle.is_enabled(),
            ready: handle.is_ready(),
            state: handle.state_label().to_string(),
            restarts: handle.restarts(),
            in_flight: handle.metrics().in_flight(),
            queue_depth: handle.metrics().queue_depth(),
            error: if handle.is_enabled() {
                handle.unavailable_reason()
            } else {
                None
            },
        }
    }
}

/// Snapshot published after every check cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Aggregated readiness
    pub status: Readiness,
    /// Per-engine health, in configuration order
    pub engines: Vec<EngineHealth>,
    /// Service counters
    pub metrics: MetricsSnapshot,
    /// When the report was built
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Build a report from the pool's current state without probing
    #[must_use]
    pub fn from_pool(pool: &EnginePool) -> Self {
        let engines: Vec<EngineHealth> = pool.handles().map(|h| EngineHealth::from_handle(h)).collect();
        Self {
            status: readiness(pool),
            engines,
            metrics: pool.metrics().snapshot(),
            checked_at: Utc::now(),
        }
    }
}

/// Healthy when every enabled engine is serving, degraded when some are,
/// down when none is
#[must_use]
pub fn readiness(pool: &EnginePool) -> Readiness {
    let enabled: Vec<&Arc<EngineHandle>> = pool.handles().filter(|h| h.is_enabled()).collect();
    let serving = enabled.iter().filter(|h| h.is_available()).count();
    if serving == 0 {
        Readiness::Down
    } else if serving == enabled.len() {
        Readiness::Healthy
    } else {
        Readiness::Degraded
    }
}

// === Individual Probe Result ===

/// Result of probing one engine slot
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Engine name
    pub engine: String,

    /// Slot index
    pub slot: usize,

    /// Whether the slot is serving after the probe
    pub is_healthy: bool,

    /// Whether the slot was restarted during this probe
    pub was_restarted: bool,

    /// Whether the slot has permanently failed
    pub permanently_failed: bool,

    /// `isready` round-trip time, when a ping was sent
    pub round_trip: Option<Duration>,

    /// Error message if unhealthy
    pub error_message: Option<String>,
}

impl ProbeResult {
    fn new(slot: &EngineSlot) -> Self {
        Self {
            engine: slot.engine().to_string(),
            slot: slot.index(),
            is_healthy: true,
            was_restarted: false,
            permanently_failed: false,
            round_trip: None,
            error_message: None,
        }
    }
}

// === Health Monitor ===

/// Background health monitor for the engine pool.
pub struct HealthMonitor {
    /// Interval between health checks.
    interval: Duration,

    /// Timeout for the `isready` round-trip.
    probe_timeout: Duration,

    /// Shutdown flag for graceful termination.
    shutdown: Arc<AtomicBool>,

    /// Wakes the loop early on shutdown.
    wake: Arc<Notify>,

    /// Handle to the background monitoring task.
    handle: Option<JoinHandle<()>>,

    /// Most recent report.
    latest: Arc<RwLock<Option<HealthReport>>>,
}

impl HealthMonitor {
    /// Create a new health monitor with the specified intervals.
    #[must_use]
    pub fn new(interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            interval,
            probe_timeout,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            handle: None,
            latest: Arc::new(RwLock::new(None)),
        }
    }

    /// Create a health monitor from configuration.
    #[must_use]
    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(config.probe_interval, config.probe_timeout)
    }

    /// Start the health monitoring background task.
    pub fn start(&mut self, pool: Arc<EnginePool>) {
        self.shutdown.store(false, Ordering::SeqCst);

        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);
        let latest = Arc::clone(&self.latest);
        let interval = self.interval;
        let probe_timeout = self.probe_timeout;

        let handle = tokio::spawn(async move {
            Self::health_check_loop(pool, interval, probe_timeout, shutdown, wake, latest).await;
        });

        self.handle = Some(handle);
        info!(interval_ms = %self.interval.as_millis(), "Health monitor started");
    }

    /// Stop the health monitoring gracefully.
    ///
    /// Signals the background task to stop and waits for it to complete.
    pub async fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();

        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }

        info!("Health monitor stopped");
    }

    /// Check if the monitor is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.shutdown.load(Ordering::SeqCst)
    }

    /// Report from the last completed cycle, if any
    #[must_use]
    pub fn latest(&self) -> Option<HealthReport> {
        self.latest.read().expect("RwLock poisoned").clone()
    }

    /// Probe every slot once and build a fresh report
    pub async fn run_once(pool: &EnginePool, probe_timeout: Duration) -> HealthReport {
        let results = Self::check_all_slots(pool, probe_timeout).await;
        Self::log_results(&results);
        HealthReport::from_pool(pool)
    }

    /// Perform a single probe of every engine slot.
    ///
    /// Exposed for manual health checks and tests.
    pub async fn check_all_slots(pool: &EnginePool, probe_timeout: Duration) -> Vec<ProbeResult> {
        let slots: Vec<Arc<EngineSlot>> = pool
            .handles()
            .flat_map(|h| h.slots().iter().cloned())
            .collect();

        let mut results = Vec::with_capacity(slots.len());
        for slot in slots {
            results.push(Self::check_slot(&slot, probe_timeout).await);
        }
        results
    }

    /// Probe one slot, restarting it if the process died or stopped answering
    async fn check_slot(slot: &EngineSlot, probe_timeout: Duration) -> ProbeResult {
        let mut result = ProbeResult::new(slot);

        match slot.status() {
            SlotStatus::Failed { reason } => {
                result.is_healthy = false;
                result.permanently_failed = true;
                result.error_message = Some(reason);
                return result;
            }
            SlotStatus::Stopped => {
                result.is_healthy = false;
                result.error_message = Some("engine stopped".to_string());
                return result;
            }
            _ => {}
        }

        // A held lock means a search or restart is in progress
        let Some(mut inner) = slot.try_lock() else {
            if !slot.is_alive() && slot.status() != SlotStatus::Restarting {
                warn!(
                    engine = %slot.engine(),
                    slot = slot.index(),
                    "Engine process died while busy, worker will restart it"
                );
                result.is_healthy = false;
                result.error_message = Some("process died during search".to_string());
            }
            return result;
        };

        let failure = if slot.is_alive() {
            match inner.session_mut() {
                Some(session) if session.state() == SessionState::Ready => {
                    match session.ping(probe_timeout).await {
                        Ok(round_trip) => {
                            result.round_trip = Some(round_trip);
                            None
                        }
                        Err(e) => Some(format!("ping failed: {e}")),
                    }
                }
                Some(session) => Some(format!("session is {}", session.state())),
                None => Some("no session installed".to_string()),
            }
        } else {
            Some("process is not alive".to_string())
        };

        let Some(reason) = failure else {
            debug!(engine = %slot.engine(), slot = slot.index(), round_trip = ?result.round_trip, "Engine probe passed");
            return result;
        };

        warn!(engine = %slot.engine(), slot = slot.index(), reason = %reason, "Engine probe failed");
        match slot.recover(&mut inner, &reason).await {
            Ok(()) => {
                result.was_restarted = true;
                result.error_message = Some(reason);
            }
            Err(e) => {
                result.is_healthy = false;
                result.permanently_failed = true;
                result.error_message = Some(e.to_string());
            }
        }
        result
    }

    fn log_results(results: &[ProbeResult]) {
        for result in results {
            if result.was_restarted {
                info!(engine = %result.engine, slot = result.slot, "Engine was restarted");
            }
        }
    }

    /// The main health check loop running in the background.
    async fn health_check_loop(
        pool: Arc<EnginePool>,
        interval: Duration,
        probe_timeout: Duration,
        shutdown: Arc<AtomicBool>,
        wake: Arc<Notify>,
        latest: Arc<RwLock<Option<HealthReport>>>,
    ) {
        debug!("Health check loop started");

        loop {
            if shutdown.load(Ordering::SeqCst) {
                debug!("Health check loop received shutdown signal");
                break;
            }

            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = wake.notified() => {}
            }

            // Check shutdown again after sleep
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            let report = Self::run_once(&pool, probe_timeout).await;
            match report.status {
                Readiness::Healthy => {
                    debug!(engine_count = report.engines.len(), "All engines healthy");
                }
                Readiness::Degraded => {
                    let failed: Vec<&str> = report
                        .engines
                        .iter()
                        .filter(|e| e.enabled && e.state == "failed")
                        .map(|e| e.name.as_str())
                        .collect();
                    warn!(failed = ?failed, "Service degraded");
                }
                Readiness::Down => {
                    error!("Critical: no engine is serving");
                }
            }
            *latest.write().expect("RwLock poisoned") = Some(report);
        }

        debug!("Health check loop ended");
    }
}

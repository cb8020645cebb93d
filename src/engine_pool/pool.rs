// ABOUTME: Engine pool owning one protocol session per concurrency slot of every engine
// ABOUTME: Launches, configures and restarts engine processes behind per-slot exclusive locks

//! Engine pool management
//!
//! The `EnginePool` holds one `EngineHandle` per configured engine. Each
//! handle owns `concurrency_limit` slots, and each slot owns one engine
//! process and its `ProtocolSession`. A slot's tokio mutex is the exclusive
//! lock on that engine instance: a worker holds it for the whole dispatch, and
//! a restart holds it while the process is recreated and reconfigured, so new
//! dispatch to that slot waits while other engines keep running.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          EnginePool                          │
//! │  engines: HashMap<String, Arc<EngineHandle>>                 │
//! │     - lc0       -> [slot 0: Ready]                           │
//! │     - maia      -> [slot 0: Busy]                            │
//! │     - stockfish -> [slot 0: Restarting]                      │
//! │                                                              │
//! │  EngineSlot                                                  │
//! │  ┌────────────────────────┐  ┌──────────────┐  ┌──────────┐  │
//! │  │ Mutex<SlotInner>       │  │ watch status │  │ liveness │  │
//! │  │  session + backoff     │  │ (lock-free)  │  │ (probe)  │  │
//! │  └────────────────────────┘  └──────────────┘  └──────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```ignore
//! let pool = Arc::new(EnginePool::new(descriptors, pool_config, timeouts, 10, metrics)?);
//! pool.start().await;
//! let handle = pool.get("stockfish")?;
//! // ... dispatch through the scheduler ...
//! pool.shutdown().await;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{debug, error, info, warn};

use super::config::PoolConfig;
use super::descriptor::EngineDescriptor;
use super::grammar::OutputGrammar;
use super::metrics::{EngineMetrics, PoolMetrics};
use super::process::{EngineProcess, ExponentialBackoff, LaunchSpec, ProcessLiveness};
use super::protocol::{ProtocolSession, SessionError, SessionState, SessionTimeouts};

// === Pool Errors ===

/// Errors that can occur during pool operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// No engine with this name is configured
    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    /// Engine is disabled or could not be (re)started within the retry limit
    #[error("Engine '{engine}' unavailable: {reason}")]
    EngineUnavailable {
        /// Engine name
        engine: String,
        /// Why it is unavailable
        reason: String,
    },

    /// Two descriptors share a name
    #[error("Engine '{0}' configured more than once")]
    DuplicateEngine(String),
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

// === Slot Status ===

/// Lifecycle state of one engine slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "state")]
pub enum SlotStatus {
    /// Initial launch in progress
    Starting,
    /// Idle and configured
    Ready,
    /// Running a search for a worker
    Busy,
    /// Being recreated after a fault
    Restarting,
    /// Restart failed within the retry limit; permanent until shutdown
    Failed {
        /// Last launch error
        reason: String,
    },
    /// Shut down
    Stopped,
}

impl SlotStatus {
    /// Whether the slot is serving or on its way back to serving
    #[must_use]
    pub const fn is_serving(&self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Busy | Self::Restarting)
    }

    /// Short label for reports
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Restarting => "restarting",
            Self::Failed { .. } => "failed",
            Self::Stopped => "stopped",
        }
    }
}

// === Engine Slot ===

/// What every slot of one engine needs to (re)launch its session
#[derive(Debug)]
struct SlotContext {
    descriptor: EngineDescriptor,
    startup_options: Vec<(String, String)>,
    config: PoolConfig,
    timeouts: SessionTimeouts,
    metrics: Arc<PoolMetrics>,
}

/// State guarded by the slot lock
#[derive(Debug)]
pub struct SlotInner {
    session: Option<ProtocolSession>,
    backoff: ExponentialBackoff,
}

impl SlotInner {
    /// Session currently installed in the slot
    pub fn session_mut(&mut self) -> Option<&mut ProtocolSession> {
        self.session.as_mut()
    }

    /// Whether the installed session can take a dispatch right now
    #[must_use]
    pub fn is_dispatchable(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.state() == SessionState::Ready && s.is_alive())
    }
}

/// One engine process and session, used by at most one worker at a time
#[derive(Debug)]
pub struct EngineSlot {
    index: usize,
    context: Arc<SlotContext>,
    inner: Mutex<SlotInner>,
    status: watch::Sender<SlotStatus>,
    liveness: RwLock<Option<ProcessLiveness>>,
    restarts: AtomicU32,
}

impl EngineSlot {
    fn new(index: usize, context: Arc<SlotContext>) -> Self {
        let backoff = ExponentialBackoff::new(
            context.config.restart_backoff_base,
            context.config.restart_backoff_max,
        );
        let (status, _) = watch::channel(SlotStatus::Starting);
        Self {
            index,
            context,
            inner: Mutex::new(SlotInner {
                session: None,
                backoff,
            }),
            status,
            liveness: RwLock::new(None),
            restarts: AtomicU32::new(0),
        }
    }

    /// Engine name
    #[must_use]
    pub fn engine(&self) -> &str {
        &self.context.descriptor.name
    }

    /// Slot index within the engine
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Current status, without taking the slot lock
    #[must_use]
    pub fn status(&self) -> SlotStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SlotStatus> {
        self.status.subscribe()
    }

    /// Successful restarts so far
    #[must_use]
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Whether the slot's process is alive, without taking the slot lock
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.liveness
            .read()
            .expect("RwLock poisoned")
            .as_ref()
            .is_some_and(ProcessLiveness::is_alive)
    }

    /// Pid of the slot's current process
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.liveness
            .read()
            .expect("RwLock poisoned")
            .as_ref()
            .map(ProcessLiveness::pid)
    }

    /// Take the exclusive slot lock
    pub async fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().await
    }

    /// Take the slot lock only if no worker or restart holds it
    pub fn try_lock(&self) -> Option<MutexGuard<'_, SlotInner>> {
        self.inner.try_lock().ok()
    }

    pub(crate) fn set_status(&self, status: SlotStatus) {
        self.status.send_replace(status);
    }

    /// Return the session, restarting the engine first if it is not Ready
    ///
    /// A permanently failed slot is never relaunched.
    ///
    /// # Errors
    /// Returns `PoolError::EngineUnavailable` if the slot has failed or the
    /// restart exhausts its retry limit.
    pub async fn ensure_ready<'a>(
        &self,
        inner: &'a mut SlotInner,
    ) -> PoolResult<&'a mut ProtocolSession> {
        if !inner.is_dispatchable() {
            self.recover(inner, "session not ready for dispatch").await?;
        }
        let engine = self.engine().to_string();
        inner.session.as_mut().ok_or(PoolError::EngineUnavailable {
            engine,
            reason: "no session installed".to_string(),
        })
    }

    /// Replace a faulted or dead session with a freshly configured one
    ///
    /// Stops the old process, then relaunches up to the retry limit with
    /// exponential backoff. The slot is only marked Ready once the handshake
    /// and configuration sequence have been replayed.
    ///
    /// # Errors
    /// Returns `PoolError::EngineUnavailable` when every attempt fails; the
    /// slot is then Failed.
    pub async fn recover(&self, inner: &mut SlotInner, reason: &str) -> PoolResult<()> {
        if let SlotStatus::Failed { reason } = self.status() {
            return Err(self.unavailable(reason));
        }

        warn!(engine = %self.engine(), slot = self.index, reason = %reason, "Restarting engine");
        self.set_status(SlotStatus::Restarting);
        self.retire_session(inner).await;

        self.establish(inner).await?;
        self.restarts.fetch_add(1, Ordering::Relaxed);
        self.context.metrics.engine_restarted();
        Ok(())
    }

    /// Initial launch
    async fn start(&self) -> PoolResult<()> {
        let mut inner = self.lock().await;
        self.set_status(SlotStatus::Starting);
        self.establish(&mut inner).await
    }

    /// Launch attempts with backoff, installing the first session that
    /// completes handshake and configuration
    async fn establish(&self, inner: &mut SlotInner) -> PoolResult<()> {
        let config = &self.context.config;
        let attempts = config.restart_retry_limit.max(1);
        let mut last_error = String::from("no launch attempted");

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = inner.backoff.next_delay();
                debug!(
                    engine = %self.engine(),
                    slot = self.index,
                    attempt = attempt,
                    delay_ms = %delay.as_millis(),
                    "Backing off before relaunch"
                );
                tokio::time::sleep(delay).await;
            }

            match tokio::time::timeout(config.restart_timeout, launch_session(&self.context)).await {
                Ok(Ok(session)) => {
                    *self.liveness.write().expect("RwLock poisoned") = Some(session.liveness());
                    inner.session = Some(session);
                    inner.backoff.reset();
                    self.set_status(SlotStatus::Ready);
                    info!(
                        engine = %self.engine(),
                        slot = self.index,
                        attempt = attempt,
                        pid = ?self.pid(),
                        "Engine ready"
                    );
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(
                        engine = %self.engine(),
                        slot = self.index,
                        attempt = attempt,
                        error = %e,
                        "Engine launch failed"
                    );
                    last_error = e.to_string();
                    // A rejected option fails the same way every time
                    if matches!(e, SessionError::Configuration { .. }) {
                        break;
                    }
                }
                Err(_) => {
                    warn!(
                        engine = %self.engine(),
                        slot = self.index,
                        attempt = attempt,
                        timeout_ms = %config.restart_timeout.as_millis(),
                        "Engine launch timed out"
                    );
                    last_error = format!("launch timed out after {:?}", config.restart_timeout);
                }
            }
        }

        error!(
            engine = %self.engine(),
            slot = self.index,
            error = %last_error,
            "Engine permanently failed"
        );
        self.set_status(SlotStatus::Failed {
            reason: last_error.clone(),
        });
        Err(self.unavailable(last_error))
    }

    /// Terminate whatever session is installed
    async fn retire_session(&self, inner: &mut SlotInner) {
        *self.liveness.write().expect("RwLock poisoned") = None;
        if let Some(session) = inner.session.take() {
            let state = session.terminate(self.context.config.terminate_grace).await;
            debug!(engine = %self.engine(), slot = self.index, state = ?state, "Old engine process retired");
        }
    }

    /// Quit the session and mark the slot stopped
    async fn shutdown(&self) {
        let mut inner = self.lock().await;
        *self.liveness.write().expect("RwLock poisoned") = None;
        if let Some(session) = inner.session.take() {
            let state = session.quit(self.context.config.terminate_grace).await;
            debug!(engine = %self.engine(), slot = self.index, state = ?state, "Engine stopped");
        }
        self.set_status(SlotStatus::Stopped);
    }

    fn unavailable(&self, reason: String) -> PoolError {
        PoolError::EngineUnavailable {
            engine: self.engine().to_string(),
            reason,
        }
    }
}

/// Start the process, handshake, and replay the configuration sequence
async fn launch_session(context: &SlotContext) -> Result<ProtocolSession, SessionError> {
    let descriptor = &context.descriptor;
    let spec = LaunchSpec {
        program: descriptor.executable.clone(),
        args: descriptor.args.clone(),
        env: descriptor.env.clone(),
        launch_probe: context.config.launch_probe,
    };
    let process = EngineProcess::start(&descriptor.name, &spec).await?;

    let mut session = ProtocolSession::new(
        descriptor.name.clone(),
        OutputGrammar::for_kind(descriptor.kind),
        process,
        context.timeouts,
    );
    session.handshake().await?;
    session.configure(&context.startup_options).await?;
    Ok(session)
}

// === Engine Handle ===

/// One configured engine and its slots
#[derive(Debug)]
pub struct EngineHandle {
    descriptor: EngineDescriptor,
    slots: Vec<Arc<EngineSlot>>,
    metrics: Arc<EngineMetrics>,
}

impl EngineHandle {
    /// Engine name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Immutable descriptor
    #[must_use]
    pub const fn descriptor(&self) -> &EngineDescriptor {
        &self.descriptor
    }

    /// Concurrency slots; empty for a disabled engine
    #[must_use]
    pub fn slots(&self) -> &[Arc<EngineSlot>] {
        &self.slots
    }

    /// Per-engine counters
    #[must_use]
    pub const fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Whether the engine is enabled
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.descriptor.enabled
    }

    /// Whether any slot is serving or recovering
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.is_enabled() && self.slots.iter().any(|s| s.status().is_serving())
    }

    /// Whether any slot is Ready or Busy right now
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.slots
            .iter()
            .any(|s| matches!(s.status(), SlotStatus::Ready | SlotStatus::Busy))
    }

    /// Overall engine state label derived from its slots
    #[must_use]
    pub fn state_label(&self) -> &'static str {
        if !self.is_enabled() {
            return "disabled";
        }
        let statuses: Vec<SlotStatus> = self.slots.iter().map(|s| s.status()).collect();
        for wanted in ["busy", "ready", "restarting", "starting", "stopped"] {
            if statuses.iter().any(|s| s.label() == wanted) {
                return wanted;
            }
        }
        "failed"
    }

    /// Successful restarts over all slots
    #[must_use]
    pub fn restarts(&self) -> u32 {
        self.slots.iter().map(|s| s.restarts()).sum()
    }

    /// Reason the engine cannot serve, if it cannot
    #[must_use]
    pub fn unavailable_reason(&self) -> Option<String> {
        if !self.is_enabled() {
            return Some("engine is disabled".to_string());
        }
        if self.is_available() {
            return None;
        }
        let reason = self
            .slots
            .iter()
            .find_map(|s| match s.status() {
                SlotStatus::Failed { reason } => Some(reason),
                _ => None,
            })
            .unwrap_or_else(|| "engine is stopped".to_string());
        Some(reason)
    }
}

// === Engine Pool ===

/// Owner of every engine process in the service
#[derive(Debug)]
pub struct EnginePool {
    engines: HashMap<String, Arc<EngineHandle>>,

    /// Engine names in configuration order
    order: Vec<String>,

    config: PoolConfig,
    metrics: Arc<PoolMetrics>,
}

impl EnginePool {
    /// Build the pool; nothing is launched until `start`
    ///
    /// # Errors
    /// Returns `PoolError::DuplicateEngine` if two descriptors share a name.
    pub fn new(
        descriptors: Vec<EngineDescriptor>,
        config: PoolConfig,
        timeouts: SessionTimeouts,
        multipv: u32,
        metrics: Arc<PoolMetrics>,
    ) -> PoolResult<Self> {
        let mut engines = HashMap::new();
        let mut order = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let name = descriptor.name.clone();
            if engines.contains_key(&name) {
                return Err(PoolError::DuplicateEngine(name));
            }

            let slot_count = if descriptor.enabled {
                descriptor.concurrency_limit.max(1)
            } else {
                0
            };
            let context = Arc::new(SlotContext {
                startup_options: descriptor.startup_options(multipv),
                descriptor: descriptor.clone(),
                config: config.clone(),
                timeouts,
                metrics: Arc::clone(&metrics),
            });
            let slots = (0..slot_count)
                .map(|index| Arc::new(EngineSlot::new(index, Arc::clone(&context))))
                .collect();

            engines.insert(
                name.clone(),
                Arc::new(EngineHandle {
                    descriptor,
                    slots,
                    metrics: Arc::new(EngineMetrics::new()),
                }),
            );
            order.push(name);
        }

        Ok(Self {
            engines,
            order,
            config,
            metrics,
        })
    }

    /// Launch every slot of every enabled engine concurrently
    ///
    /// Engines that fail to start are left Failed; the pool still serves the
    /// others. Returns the number of slots that came up.
    pub async fn start(&self) -> usize {
        info!(engines = self.order.len(), "Starting engine pool");

        let slots: Vec<Arc<EngineSlot>> = self
            .handles()
            .flat_map(|h| h.slots.iter().cloned())
            .collect();
        let outcomes = join_all(slots.iter().map(|slot| slot.start())).await;
        let ready = outcomes.iter().filter(|r| r.is_ok()).count();

        for handle in self.handles().filter(|h| !h.is_enabled()) {
            info!(engine = %handle.name(), "Engine disabled, not started");
        }
        info!(ready_slots = ready, total_slots = slots.len(), "Engine pool started");
        ready
    }

    /// Look up an engine that can take work
    ///
    /// # Errors
    /// `UnknownEngine` if no such engine is configured, `EngineUnavailable`
    /// if it is disabled or permanently failed.
    pub fn get(&self, name: &str) -> PoolResult<&Arc<EngineHandle>> {
        let handle = self
            .engines
            .get(name)
            .ok_or_else(|| PoolError::UnknownEngine(name.to_string()))?;
        if let Some(reason) = handle.unavailable_reason() {
            return Err(PoolError::EngineUnavailable {
                engine: name.to_string(),
                reason,
            });
        }
        Ok(handle)
    }

    /// Look up an engine regardless of its availability
    #[must_use]
    pub fn handle(&self, name: &str) -> Option<&Arc<EngineHandle>> {
        self.engines.get(name)
    }

    /// Every engine in configuration order
    pub fn handles(&self) -> impl Iterator<Item = &Arc<EngineHandle>> {
        self.order.iter().filter_map(|name| self.engines.get(name))
    }

    /// Engine names in configuration order
    #[must_use]
    pub fn engine_names(&self) -> &[String] {
        &self.order
    }

    /// Pool configuration
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Service counters
    #[must_use]
    pub const fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    /// Quit every engine
    ///
    /// Waits for in-flight dispatch to release each slot, bounded per slot by
    /// the terminate grace plus the search grace.
    pub async fn shutdown(&self) {
        info!(engines = self.order.len(), "Shutting down engine pool");
        let limit = self.config.terminate_grace + self.config.search_grace;
        let slots: Vec<Arc<EngineSlot>> = self
            .handles()
            .flat_map(|h| h.slots.iter().cloned())
            .collect();

        let stops = slots.iter().map(|slot| async move {
            if tokio::time::timeout(limit + Duration::from_secs(1), slot.shutdown())
                .await
                .is_err()
            {
                warn!(engine = %slot.engine(), slot = slot.index(), "Engine shutdown timed out");
            }
        });
        join_all(stops).await;
        info!("Engine pool shutdown complete");
    }
}

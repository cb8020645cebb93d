// ABOUTME: Analysis scheduler fanning requests out to per-engine FIFO queues and slot workers
// ABOUTME: Enforces queue-depth backpressure, cancellation and the aggregate result deadline

//! Analysis scheduling
//!
//! `submit` validates a request, then enqueues one entry per targeted engine.
//! Every engine slot runs one worker that pops its engine's queue in FIFO
//! order, takes the slot lock, restarts the engine if needed, and runs the
//! search. Each (request, engine) pair is answered exactly once through a
//! oneshot channel; `AnalysisHandle::wait` merges the answers, marking engines
//! that miss the aggregate deadline as timed out.
//!
//! ```text
//!  submit ──▶ EngineQueue(lc0) ──▶ worker(lc0#0) ──┐
//!        └──▶ EngineQueue(sf)  ──▶ worker(sf#0)  ──┼──▶ oneshot ──▶ AnalysisHandle::wait
//!                              └─▶ worker(sf#1)  ──┘
//! ```

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

use super::analysis::{
    AggregateResult, AnalysisRequest, AnalysisResult, AnalysisStatus, BudgetError, RequestId,
};
use super::backpressure::{Admission, BackpressureError, EngineQueue};
use super::config::SchedulerConfig;
use super::metrics::PoolMetrics;
use super::normalizer::normalize_result;
use super::pool::{EngineHandle, EnginePool, EngineSlot, PoolError, SlotStatus};
use super::position::{Position, PositionError};
use super::protocol::{ProtocolSession, SearchBudget, SearchOutcome, SessionError, StopReason};

/// Errors surfaced by `submit` and `cancel`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Search budget missing, conflicting or zero
    #[error("Invalid search budget: {0}")]
    InvalidBudget(#[from] BudgetError),

    /// Request shape is wrong (no engines, duplicates, zero candidates)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Position notation is malformed or illegal
    #[error("Invalid position: {0}")]
    InvalidPosition(#[from] PositionError),

    /// Unknown or unavailable engine
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A targeted engine's queue is full
    #[error("Engine '{engine}' overloaded: queue capacity {capacity} reached")]
    Overloaded {
        /// Engine whose queue is full
        engine: String,
        /// Configured queue depth
        capacity: usize,
    },

    /// No pending request with this id
    #[error("Unknown request: {0}")]
    UnknownRequest(RequestId),

    /// Scheduler no longer accepts work
    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

impl From<BackpressureError> for SchedulerError {
    fn from(err: BackpressureError) -> Self {
        match err {
            BackpressureError::QueueFull {
                engine, capacity, ..
            } => Self::Overloaded { engine, capacity },
            BackpressureError::Closed { .. } => Self::ShuttingDown,
        }
    }
}

/// One (request, engine) pair waiting for a worker
#[derive(Debug)]
pub struct QueueEntry {
    request_id: RequestId,
    request: Arc<AnalysisRequest>,
    budget: SearchBudget,
    engine: String,
    submitted_at: Instant,
    cancel: watch::Receiver<bool>,
    reply: oneshot::Sender<AnalysisResult>,
}

impl QueueEntry {
    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Bookkeeping for a request with unanswered engines
#[derive(Debug)]
struct RequestControl {
    cancel: watch::Sender<bool>,
    remaining: usize,
}

/// State shared by the scheduler, its workers and outstanding handles
#[derive(Debug)]
struct Shared {
    queues: HashMap<String, Arc<EngineQueue<QueueEntry>>>,
    requests: Mutex<HashMap<RequestId, RequestControl>>,
    metrics: Arc<PoolMetrics>,
}

impl Shared {
    /// Answer one pair and retire the request once every pair is answered
    fn deliver(&self, entry: QueueEntry, result: AnalysisResult) {
        self.metrics.record_result(result.status);
        debug!(
            request_id = %entry.request_id,
            engine = %entry.engine,
            status = ?result.status,
            elapsed_ms = result.elapsed_ms,
            "Result delivered"
        );
        let _ = entry.reply.send(result);

        let mut requests = self.requests.lock().expect("Mutex poisoned");
        if let Some(control) = requests.get_mut(&entry.request_id) {
            control.remaining = control.remaining.saturating_sub(1);
            if control.remaining == 0 {
                requests.remove(&entry.request_id);
            }
        }
    }

    fn cancel(&self, request_id: RequestId) -> Result<(), SchedulerError> {
        {
            let requests = self.requests.lock().expect("Mutex poisoned");
            let control = requests
                .get(&request_id)
                .ok_or(SchedulerError::UnknownRequest(request_id))?;
            control.cancel.send_replace(true);
        }

        // Queued pairs never reach an engine
        let mut dropped = 0;
        for queue in self.queues.values() {
            for entry in queue.remove_where(|e| e.request_id == request_id) {
                let result = AnalysisResult::cancelled(request_id, entry.engine.clone())
                    .with_elapsed(entry.submitted_at.elapsed());
                self.deliver(entry, result);
                dropped += 1;
            }
        }
        info!(request_id = %request_id, dropped_from_queue = dropped, "Request cancelled");
        Ok(())
    }

    fn forget(&self, request_id: RequestId) {
        self.requests
            .lock()
            .expect("Mutex poisoned")
            .remove(&request_id);
    }
}

// === Scheduler ===

/// Dispatches analysis requests to the engine pool
#[derive(Debug)]
pub struct AnalysisScheduler {
    pool: Arc<EnginePool>,
    config: SchedulerConfig,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AnalysisScheduler {
    /// Create the queues and spawn one worker per engine slot
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(pool: Arc<EnginePool>, config: SchedulerConfig) -> Self {
        let queues: HashMap<String, Arc<EngineQueue<QueueEntry>>> = pool
            .handles()
            .filter(|h| h.is_enabled())
            .map(|h| {
                (
                    h.name().to_string(),
                    Arc::new(EngineQueue::new(h.name(), config.max_queue_depth)),
                )
            })
            .collect();

        let shared = Arc::new(Shared {
            queues,
            requests: Mutex::new(HashMap::new()),
            metrics: Arc::clone(pool.metrics()),
        });

        let mut workers = Vec::new();
        for handle in pool.handles().filter(|h| h.is_enabled()) {
            let Some(queue) = shared.queues.get(handle.name()) else {
                continue;
            };
            for slot in handle.slots() {
                let worker = Worker {
                    handle: Arc::clone(handle),
                    slot: Arc::clone(slot),
                    queue: Arc::clone(queue),
                    shared: Arc::clone(&shared),
                };
                workers.push(tokio::spawn(worker.run()));
            }
        }
        info!(
            engines = shared.queues.len(),
            workers = workers.len(),
            max_queue_depth = config.max_queue_depth,
            "Analysis scheduler started"
        );

        Self {
            pool,
            config,
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Validate and enqueue a request on every targeted engine
    ///
    /// Admission is all-or-nothing: if any targeted queue is full, nothing
    /// is enqueued and `Overloaded` names that engine.
    ///
    /// # Errors
    /// Validation errors, `Pool` errors for unknown or unavailable engines,
    /// `Overloaded` when a queue is full.
    pub fn submit(&self, request: AnalysisRequest) -> Result<AnalysisHandle, SchedulerError> {
        let budget = request.budget()?;
        if request.max_moves == 0 {
            return Err(SchedulerError::InvalidRequest(
                "number of candidate moves must be at least 1".to_string(),
            ));
        }
        if request.engines.is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "no engine requested".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = request.engines.iter().find(|e| !seen.insert(e.as_str())) {
            return Err(SchedulerError::InvalidRequest(format!(
                "engine '{dup}' requested more than once"
            )));
        }

        let position = Position::parse(&request.position)?;

        let mut queues = Vec::with_capacity(request.engines.len());
        for engine in &request.engines {
            self.pool.get(engine)?;
            let queue = self
                .shared
                .queues
                .get(engine)
                .ok_or_else(|| PoolError::EngineUnavailable {
                    engine: engine.clone(),
                    reason: "engine has no queue".to_string(),
                })?;
            queues.push(Arc::clone(queue));
        }

        let request_id = RequestId::new();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.shared
            .requests
            .lock()
            .expect("Mutex poisoned")
            .insert(
                request_id,
                RequestControl {
                    cancel: cancel_tx,
                    remaining: queues.len(),
                },
            );

        let request = Arc::new(request);
        let submitted_at = Instant::now();
        let mut pending = Vec::with_capacity(queues.len());
        let mut entries = Vec::with_capacity(queues.len());
        for queue in &queues {
            let (reply, receiver) = oneshot::channel();
            pending.push((queue.engine().to_string(), receiver));
            entries.push(QueueEntry {
                request_id,
                request: Arc::clone(&request),
                budget,
                engine: queue.engine().to_string(),
                submitted_at,
                cancel: cancel_rx.clone(),
                reply,
            });
        }

        if let Err(e) = self.admit(&queues, entries) {
            self.shared.forget(request_id);
            if matches!(e, SchedulerError::Overloaded { .. }) {
                self.shared.metrics.request_rejected();
                warn!(request_id = %request_id, error = %e, "Request rejected");
            }
            return Err(e);
        }
        self.shared.metrics.request_submitted();

        debug!(
            request_id = %request_id,
            engines = ?request.engines,
            budget = ?budget,
            max_moves = request.max_moves,
            "Request queued"
        );

        Ok(AnalysisHandle {
            request_id,
            fen: position.fen(),
            pending,
            started: submitted_at,
            deadline: submitted_at + self.config.aggregate_deadline,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Lock every targeted queue in name order, check them all, then push
    fn admit(
        &self,
        queues: &[Arc<EngineQueue<QueueEntry>>],
        entries: Vec<QueueEntry>,
    ) -> Result<(), SchedulerError> {
        let mut order: Vec<usize> = (0..queues.len()).collect();
        order.sort_by(|&a, &b| queues[a].engine().cmp(queues[b].engine()));

        let mut admissions: Vec<Option<Admission<'_, QueueEntry>>> =
            queues.iter().map(|_| None).collect();
        for &i in &order {
            let admission = queues[i].admission();
            admission.check()?;
            admissions[i] = Some(admission);
        }

        for (admission, entry) in admissions.iter_mut().zip(entries) {
            if let Some(admission) = admission.as_mut() {
                admission.push(entry);
            }
        }
        drop(admissions);

        for queue in queues {
            if let Ok(handle) = self.pool.get(queue.engine()) {
                handle.metrics().set_queue_depth(queue.len());
            }
        }
        Ok(())
    }

    /// Submit and wait for the merged result
    ///
    /// # Errors
    /// Same as `submit`.
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AggregateResult, SchedulerError> {
        Ok(self.submit(request)?.wait().await)
    }

    /// Cancel a pending request
    ///
    /// Queued pairs are answered `cancelled` without touching an engine;
    /// searching pairs get one `stop` and their partial result is dropped.
    ///
    /// # Errors
    /// `UnknownRequest` if the request already finished or never existed.
    pub fn cancel(&self, request_id: RequestId) -> Result<(), SchedulerError> {
        self.shared.cancel(request_id)
    }

    /// Waiting entries for one engine
    #[must_use]
    pub fn queue_depth(&self, engine: &str) -> usize {
        self.shared.queues.get(engine).map_or(0, |q| q.len())
    }

    /// Requests with at least one unanswered engine
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.requests.lock().expect("Mutex poisoned").len()
    }

    /// Engine pool behind this scheduler
    #[must_use]
    pub const fn pool(&self) -> &Arc<EnginePool> {
        &self.pool
    }

    /// Stop accepting work, cancel everything pending and stop the workers
    ///
    /// The engines themselves are left to `EnginePool::shutdown`.
    pub async fn shutdown(&self) {
        info!("Shutting down analysis scheduler");
        for queue in self.shared.queues.values() {
            queue.close();
        }

        let pending: Vec<RequestId> = self
            .shared
            .requests
            .lock()
            .expect("Mutex poisoned")
            .keys()
            .copied()
            .collect();
        for request_id in pending {
            let _ = self.shared.cancel(request_id);
        }

        let workers: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().expect("Mutex poisoned"));
        let limit = self.pool.config().search_grace + self.pool.config().terminate_grace;
        for worker in workers {
            let abort = worker.abort_handle();
            if tokio::time::timeout(limit, worker).await.is_err() {
                warn!("Worker did not stop in time, aborting");
                abort.abort();
            }
        }
        info!("Analysis scheduler stopped");
    }
}

// === Handle ===

/// Outstanding request; resolves to the merged per-engine results
#[derive(Debug)]
pub struct AnalysisHandle {
    request_id: RequestId,
    fen: String,
    pending: Vec<(String, oneshot::Receiver<AnalysisResult>)>,
    started: Instant,
    deadline: Instant,
    shared: Arc<Shared>,
}

impl AnalysisHandle {
    /// Id assigned at submission
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Targeted engines in request order
    pub fn engines(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(|(engine, _)| engine.as_str())
    }

    /// Wait for every engine, or until the aggregate deadline
    ///
    /// Engines still queued or searching at the deadline are reported
    /// timed out and their work is cancelled.
    pub async fn wait(self) -> AggregateResult {
        let Self {
            request_id,
            fen,
            pending,
            started,
            deadline,
            shared,
        } = self;

        let waits = pending.into_iter().map(|(engine, receiver)| async move {
            match timeout_at(deadline, receiver).await {
                Ok(Ok(result)) => (result, false),
                Ok(Err(_)) => (
                    AnalysisResult::engine_error(request_id, engine, "worker stopped before answering")
                        .with_elapsed(started.elapsed()),
                    false,
                ),
                Err(_) => (
                    AnalysisResult::timed_out(request_id, engine, "aggregate deadline exceeded")
                        .with_elapsed(started.elapsed()),
                    true,
                ),
            }
        });
        let answered = join_all(waits).await;

        let late = answered.iter().filter(|(_, late)| *late).count();
        if late > 0 {
            warn!(request_id = %request_id, late_engines = late, "Aggregate deadline reached");
            let _ = shared.cancel(request_id);
        }

        AggregateResult {
            request_id,
            fen,
            results: answered.into_iter().map(|(result, _)| result).collect(),
        }
    }
}

// === Worker ===

/// Serves one slot of one engine
struct Worker {
    handle: Arc<EngineHandle>,
    slot: Arc<EngineSlot>,
    queue: Arc<EngineQueue<QueueEntry>>,
    shared: Arc<Shared>,
}

impl Worker {
    async fn run(self) {
        debug!(engine = %self.handle.name(), slot = self.slot.index(), "Worker started");
        while let Some(entry) = self.queue.pop().await {
            self.handle.metrics().set_queue_depth(self.queue.len());
            let result = match AssertUnwindSafe(self.serve(&entry)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => self.contain_panic(&entry).await,
            };
            self.shared.deliver(entry, result);
        }
        debug!(engine = %self.handle.name(), slot = self.slot.index(), "Worker stopped");
    }

    async fn serve(&self, entry: &QueueEntry) -> AnalysisResult {
        let request_id = entry.request_id;
        let engine = self.handle.name();
        if entry.is_cancelled() {
            return AnalysisResult::cancelled(request_id, engine)
                .with_elapsed(entry.submitted_at.elapsed());
        }

        let mut inner = self.slot.lock().await;
        let session = match self.slot.ensure_ready(&mut inner).await {
            Ok(session) => session,
            Err(e) => {
                self.fail_queue_if_engine_down();
                return AnalysisResult::engine_error(request_id, engine, e.to_string())
                    .with_elapsed(entry.submitted_at.elapsed());
            }
        };
        if entry.is_cancelled() {
            return AnalysisResult::cancelled(request_id, engine)
                .with_elapsed(entry.submitted_at.elapsed());
        }

        self.slot.set_status(SlotStatus::Busy);
        self.handle.metrics().search_started();
        let started = Instant::now();
        debug!(
            request_id = %request_id,
            engine = %engine,
            slot = self.slot.index(),
            queued_ms = %started.duration_since(entry.submitted_at).as_millis(),
            "Dispatching search"
        );

        let outcome = dispatch(session, entry).await;
        let elapsed = started.elapsed();

        let (result, fault) = match outcome {
            Ok((_, outcome)) if outcome.stop_reason == StopReason::Cancelled || entry.is_cancelled() => {
                (AnalysisResult::cancelled(request_id, engine), None)
            }
            Ok((position, outcome)) => (
                normalize_result(
                    request_id,
                    engine,
                    &outcome,
                    &position,
                    self.handle.descriptor().score_scale,
                ),
                None,
            ),
            Err(e @ SessionError::SearchTimeout { .. }) => {
                let message = e.to_string();
                (AnalysisResult::timed_out(request_id, engine, message.clone()), Some(message))
            }
            Err(e) if e.is_engine_failure() => {
                let message = e.to_string();
                (AnalysisResult::engine_error(request_id, engine, message.clone()), Some(message))
            }
            Err(e) => (AnalysisResult::engine_error(request_id, engine, e.to_string()), None),
        };

        if result.status == AnalysisStatus::EngineError || result.status == AnalysisStatus::TimedOut {
            self.handle.metrics().search_failed();
        } else {
            self.handle.metrics().search_completed();
        }

        let needs_restart = fault.is_some() || !inner.is_dispatchable();
        if needs_restart {
            let reason = fault.unwrap_or_else(|| "session left unusable".to_string());
            if self.slot.recover(&mut inner, &reason).await.is_err() {
                drop(inner);
                self.fail_queue_if_engine_down();
            }
        } else {
            self.slot.set_status(SlotStatus::Ready);
        }

        result.with_elapsed(elapsed)
    }

    /// Answer the entry whose serving panicked and put the slot back in service
    async fn contain_panic(&self, entry: &QueueEntry) -> AnalysisResult {
        let engine = self.handle.name();
        error!(
            request_id = %entry.request_id,
            engine = %engine,
            slot = self.slot.index(),
            "Worker panicked while serving request"
        );
        // Busy is set right before the search is counted as started
        if matches!(self.slot.status(), SlotStatus::Busy) {
            self.handle.metrics().search_failed();
        }

        let mut inner = self.slot.lock().await;
        if self.slot.recover(&mut inner, "worker panicked").await.is_err() {
            drop(inner);
            self.fail_queue_if_engine_down();
        }

        AnalysisResult::engine_error(entry.request_id, engine, "internal failure while serving request")
            .with_elapsed(entry.submitted_at.elapsed())
    }

    /// Fail everything queued once no slot of the engine can recover
    fn fail_queue_if_engine_down(&self) {
        let down = self
            .handle
            .slots()
            .iter()
            .all(|s| matches!(s.status(), SlotStatus::Failed { .. }));
        if !down {
            return;
        }
        let reason = self
            .handle
            .unavailable_reason()
            .unwrap_or_else(|| "engine failed".to_string());
        let entries = self.queue.drain();
        if !entries.is_empty() {
            warn!(
                engine = %self.handle.name(),
                failed_entries = entries.len(),
                "Engine unavailable, failing queued requests"
            );
        }
        self.handle.metrics().set_queue_depth(0);
        for entry in entries {
            let message = PoolError::EngineUnavailable {
                engine: entry.engine.clone(),
                reason: reason.clone(),
            }
            .to_string();
            let result = AnalysisResult::engine_error(entry.request_id, entry.engine.clone(), message)
                .with_elapsed(entry.submitted_at.elapsed());
            self.shared.deliver(entry, result);
        }
    }
}

/// Load the position and run the search on an exclusive session
async fn dispatch(
    session: &mut ProtocolSession,
    entry: &QueueEntry,
) -> Result<(Position, SearchOutcome), SessionError> {
    let position = session.load_position(&entry.request.position).await?;
    let mut cancel = entry.cancel.clone();
    let outcome = session
        .search(entry.budget, entry.request.max_moves, &mut cancel)
        .await?;
    Ok((position, outcome))
}

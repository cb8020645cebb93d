// ABOUTME: Inbound boundary: request/response DTOs and the service handle an HTTP layer routes to
//
// Routes of the outer HTTP collaborator map one-to-one onto ServiceHandle:
// - POST /analyze        -> analyze (or submit + wait)
// - DELETE /analyze/{id} -> cancel
// - GET /health          -> health
// - GET /engines         -> engines
//
// Every error carries an HTTP-style status code and a stable machine code.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::engine_pool::health::EngineHealth;
use crate::engine_pool::metrics::MetricsSnapshot;
use crate::engine_pool::{
    AggregateResult, AnalysisHandle, AnalysisRequest, AnalysisResult, AnalysisScheduler,
    AnalysisStatus, EngineKind, EnginePool, HealthMonitor, HealthReport, PoolError, Readiness,
    RequestId, SchedulerError,
};

const NODES_RANGE: std::ops::RangeInclusive<u64> = 1_000..=10_000_000;
const DEPTH_RANGE: std::ops::RangeInclusive<u32> = 1..=50;
const TIME_MS_RANGE: std::ops::RangeInclusive<u64> = 10..=600_000;
const NUM_MOVES_RANGE: std::ops::RangeInclusive<u32> = 1..=50;

// === Errors ===

/// Errors returned to the caller of the boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Malformed or out-of-range request
    #[error("{0}")]
    BadRequest(String),

    /// Position that is not legal chess
    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    /// Engine name not in the configuration
    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    /// Engine disabled or failed permanently
    #[error("Engine '{engine}' unavailable: {reason}")]
    EngineUnavailable {
        /// Engine name
        engine: String,
        /// Last failure
        reason: String,
    },

    /// Target queue full
    #[error("Engine '{engine}' overloaded (queue capacity {capacity}), retry later")]
    Overloaded {
        /// Engine whose queue is full
        engine: String,
        /// Queue capacity
        capacity: usize,
    },

    /// No pending request with that id
    #[error("Unknown request: {0}")]
    UnknownRequest(String),

    /// Submissions are closed
    #[error("Service is shutting down")]
    ShuttingDown,

    /// Unexpected failure inside the service
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP-style status code
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::UnknownEngine(_) | Self::UnknownRequest(_) => 404,
            Self::InvalidPosition(_) => 422,
            Self::Overloaded { .. } => 429,
            Self::Internal(_) => 500,
            Self::EngineUnavailable { .. } | Self::ShuttingDown => 503,
        }
    }

    /// Stable machine-readable code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid_request",
            Self::InvalidPosition(_) => "invalid_position",
            Self::UnknownEngine(_) => "unknown_engine",
            Self::EngineUnavailable { .. } => "engine_unavailable",
            Self::Overloaded { .. } => "overloaded",
            Self::UnknownRequest(_) => "unknown_request",
            Self::ShuttingDown => "shutting_down",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Serializable form
    #[must_use]
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
            status: self.status_code(),
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::UnknownEngine(engine) => Self::UnknownEngine(engine),
            PoolError::EngineUnavailable { engine, reason } => {
                Self::EngineUnavailable { engine, reason }
            }
            PoolError::DuplicateEngine(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::InvalidBudget(_) | SchedulerError::InvalidRequest(_) => {
                Self::BadRequest(err.to_string())
            }
            SchedulerError::InvalidPosition(e) => Self::InvalidPosition(e.to_string()),
            SchedulerError::Pool(e) => e.into(),
            SchedulerError::Overloaded { engine, capacity } => Self::Overloaded { engine, capacity },
            SchedulerError::UnknownRequest(id) => Self::UnknownRequest(id.to_string()),
            SchedulerError::ShuttingDown => Self::ShuttingDown,
        }
    }
}

// === Request DTOs ===

/// Body of an analysis request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeRequestBody {
    /// `startpos`, `fen ...`, or a bare FEN, optionally followed by `moves ...`
    #[serde(default, alias = "fen")]
    pub position: Option<String>,

    /// Single target engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,

    /// Several target engines
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub engines: Vec<String>,

    /// Node budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u64>,

    /// Depth budget in plies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,

    /// Time budget in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,

    /// Candidate moves to return
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_moves: Option<u32>,
}

// === Response DTOs ===

/// One ranked candidate move
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveCandidate {
    /// Candidate move in UCI notation
    #[serde(rename = "move")]
    pub uci: String,
    /// Candidate move in SAN
    pub move_san: String,
    /// Centipawns, side to move's point of view
    pub score_cp: i32,
    /// Mate distance, when the line mates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mate: Option<i32>,
    /// Win/draw/loss per mille
    pub score_wdl: [u32; 3],
    /// 1 = best
    pub rank: u32,
    /// Principal variation, UCI
    pub pv: Vec<String>,
    /// Depth of the line
    pub depth: u32,
}

/// Result of one engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineAnalysis {
    /// Engine name
    pub engine: String,
    /// Terminal status
    pub status: AnalysisStatus,
    /// Ranked candidates
    pub candidates: Vec<MoveCandidate>,
    /// Engine's chosen move
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_move: Option<String>,
    /// Evaluation of the best line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_cp: Option<i32>,
    /// Mate distance of the best line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mate: Option<i32>,
    /// Nodes searched
    pub total_nodes: u64,
    /// Depth reached
    pub depth: u32,
    /// Wall-clock time, queue wait excluded
    pub time_ms: u64,
    /// Why the engine produced no result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&AnalysisResult> for EngineAnalysis {
    fn from(result: &AnalysisResult) -> Self {
        let candidates = result
            .candidates
            .iter()
            .filter_map(|line| {
                let uci = line.moves.first()?.clone();
                Some(MoveCandidate {
                    uci,
                    move_san: line.san.first().cloned().unwrap_or_default(),
                    score_cp: line.evaluation.cp,
                    mate: line.evaluation.mate,
                    score_wdl: [
                        line.evaluation.wdl.win,
                        line.evaluation.wdl.draw,
                        line.evaluation.wdl.loss,
                    ],
                    rank: line.rank,
                    pv: line.moves.clone(),
                    depth: line.depth,
                })
            })
            .collect();

        Self {
            engine: result.engine.clone(),
            status: result.status,
            candidates,
            best_move: result.best_move.clone(),
            evaluation_cp: result.evaluation.map(|e| e.cp),
            mate: result.evaluation.and_then(|e| e.mate),
            total_nodes: result.stats.nodes,
            depth: result.stats.depth,
            time_ms: result.elapsed_ms,
            error: result.error.clone(),
        }
    }
}

/// Merged response of an analysis request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    /// Id assigned at submission
    pub request_id: RequestId,
    /// Position analyzed, as FEN
    pub fen: String,
    /// One entry per targeted engine, in request order
    pub results: Vec<EngineAnalysis>,
}

impl From<&AggregateResult> for AnalyzeResponse {
    fn from(aggregate: &AggregateResult) -> Self {
        Self {
            request_id: aggregate.request_id,
            fen: aggregate.fen.clone(),
            results: aggregate.results.iter().map(EngineAnalysis::from).collect(),
        }
    }
}

/// Answer to a cancel call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    /// Id the cancel named
    pub request_id: RequestId,
    /// False when the request had already finished
    pub cancelled: bool,
}

/// Readiness probe answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    /// Boolean liveness signal for external probes
    pub live: bool,
    /// Aggregated readiness
    pub status: Readiness,
    /// Per-engine health, in configuration order
    pub engines: Vec<EngineHealth>,
    /// Service counters
    pub metrics: MetricsSnapshot,
}

impl From<HealthReport> for HealthResponse {
    fn from(report: HealthReport) -> Self {
        Self {
            live: report.status.is_serving(),
            status: report.status,
            engines: report.engines,
            metrics: report.metrics,
        }
    }
}

/// One entry of the engine listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineInfo {
    /// Configuration name
    pub id: String,
    /// Display name
    pub name: String,
    /// One-line summary
    pub description: String,
    /// Engine kind
    #[serde(rename = "type")]
    pub kind: EngineKind,
    /// Whether the engine is configured to run
    pub enabled: bool,
    /// Whether at least one slot can serve
    pub available: bool,
    /// Searches that may run at once
    pub concurrency_limit: usize,
}

/// Engine listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnginesResponse {
    /// Configured engines, in listing order
    pub engines: Vec<EngineInfo>,
}

/// Error body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub error: String,
    /// Human-readable message
    pub message: String,
    /// HTTP-style status code
    pub status: u16,
}

// === Service Handle ===

/// Running service: pool, scheduler and health monitor
pub struct ServiceHandle {
    config: ServiceConfig,
    pool: Arc<EnginePool>,
    scheduler: AnalysisScheduler,
    monitor: Mutex<HealthMonitor>,
}

impl ServiceHandle {
    /// Launch every enabled engine and start the scheduler workers
    ///
    /// # Errors
    /// `Internal` if the engine table cannot be built.
    pub async fn start(config: ServiceConfig) -> Result<Self, ApiError> {
        let metrics = Arc::new(crate::engine_pool::metrics::PoolMetrics::new());
        let pool = Arc::new(EnginePool::new(
            config.engines.clone(),
            config.pool.clone(),
            config.session_timeouts(),
            config.defaults.num_moves,
            metrics,
        )?);
        let ready = pool.start().await;
        let scheduler = AnalysisScheduler::start(Arc::clone(&pool), config.scheduler.clone());
        let monitor = Mutex::new(HealthMonitor::from_config(&config.health));
        info!(ready_slots = ready, "Service started");

        Ok(Self {
            config,
            pool,
            scheduler,
            monitor,
        })
    }

    /// Start periodic health probing
    pub async fn start_health_monitor(&self) {
        self.monitor.lock().await.start(Arc::clone(&self.pool));
    }

    /// Configuration the service runs with
    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Turn a request body into a validated analysis request
    ///
    /// # Errors
    /// `BadRequest` for missing fields, conflicting budgets, out-of-range
    /// values and time budgets that cannot finish before the aggregate
    /// deadline.
    pub fn prepare(&self, body: AnalyzeRequestBody) -> Result<AnalysisRequest, ApiError> {
        let position = body
            .position
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ApiError::BadRequest("position is required".to_string()))?;

        let budgets = [body.nodes.is_some(), body.depth.is_some(), body.time_ms.is_some()];
        if budgets.iter().filter(|set| **set).count() > 1 {
            return Err(ApiError::BadRequest(
                "set at most one of nodes, depth, time_ms".to_string(),
            ));
        }
        check_range("nodes", body.nodes, &NODES_RANGE)?;
        check_range("depth", body.depth, &DEPTH_RANGE)?;
        check_range("time_ms", body.time_ms, &TIME_MS_RANGE)?;
        if let Some(time_ms) = body.time_ms {
            let limit = self.config.max_time_budget_ms();
            if time_ms > limit {
                return Err(ApiError::BadRequest(format!(
                    "time_ms {time_ms} cannot finish before the {}ms aggregate deadline, at most {limit}",
                    self.config.scheduler.aggregate_deadline.as_millis()
                )));
            }
        }
        check_range("num_moves", body.num_moves, &NUM_MOVES_RANGE)?;

        let mut engines = Vec::new();
        engines.extend(body.engine);
        engines.extend(body.engines);
        if engines.is_empty() {
            let first = self
                .pool
                .handles()
                .find(|h| h.is_enabled())
                .map(|h| h.name().to_string())
                .ok_or_else(|| ApiError::BadRequest("no engine enabled".to_string()))?;
            engines.push(first);
        }

        let mut request = AnalysisRequest {
            position,
            engines,
            nodes: body.nodes,
            depth: body.depth,
            time: body.time_ms.map(Duration::from_millis),
            max_moves: body.num_moves.unwrap_or(self.config.defaults.num_moves),
        };
        self.config.defaults.apply_budget(&mut request);
        Ok(request)
    }

    /// Validate and enqueue; the handle resolves to the merged result
    ///
    /// # Errors
    /// Validation errors, unknown or unavailable engines, `Overloaded`.
    pub fn submit(&self, body: AnalyzeRequestBody) -> Result<AnalysisHandle, ApiError> {
        let request = self.prepare(body)?;
        Ok(self.scheduler.submit(request)?)
    }

    /// Analyze and wait for every targeted engine (or the deadline)
    ///
    /// # Errors
    /// Same as `submit`; per-engine failures are reported in the response.
    pub async fn analyze(&self, body: AnalyzeRequestBody) -> Result<AnalyzeResponse, ApiError> {
        let aggregate = self.submit(body)?.wait().await;
        Ok(AnalyzeResponse::from(&aggregate))
    }

    /// Cancel a pending request by id
    ///
    /// # Errors
    /// `BadRequest` for a malformed id, `UnknownRequest` if nothing is pending.
    pub fn cancel(&self, request_id: &str) -> Result<CancelResponse, ApiError> {
        let request_id: RequestId = request_id
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("malformed request id '{request_id}'")))?;
        self.scheduler.cancel(request_id)?;
        Ok(CancelResponse {
            request_id,
            cancelled: true,
        })
    }

    /// Current readiness without probing
    #[must_use]
    pub fn health(&self) -> HealthResponse {
        HealthReport::from_pool(&self.pool).into()
    }

    /// Probe every engine now, restarting hung ones
    pub async fn probe(&self) -> HealthResponse {
        HealthMonitor::run_once(&self.pool, self.config.health.probe_timeout)
            .await
            .into()
    }

    /// Configured engines with availability
    #[must_use]
    pub fn engines(&self) -> EnginesResponse {
        let engines = self
            .pool
            .handles()
            .map(|handle| {
                let descriptor = handle.descriptor();
                EngineInfo {
                    id: descriptor.name.clone(),
                    name: descriptor.display_name().to_string(),
                    description: descriptor.description().to_string(),
                    kind: descriptor.kind,
                    enabled: descriptor.enabled,
                    available: handle.is_available(),
                    concurrency_limit: descriptor.concurrency_limit,
                }
            })
            .collect();
        EnginesResponse { engines }
    }

    /// Stop the monitor and workers, then quit every engine
    pub async fn shutdown(&self) {
        info!("Shutting down service");
        self.monitor.lock().await.stop().await;
        self.scheduler.shutdown().await;
        self.pool.shutdown().await;
        if self.scheduler.pending_requests() > 0 {
            warn!(pending = self.scheduler.pending_requests(), "Requests left unanswered at shutdown");
        }
    }
}

fn check_range<T>(
    field: &str,
    value: Option<T>,
    range: &std::ops::RangeInclusive<T>,
) -> Result<(), ApiError>
where
    T: PartialOrd + std::fmt::Display,
{
    match value {
        Some(v) if !range.contains(&v) => Err(ApiError::BadRequest(format!(
            "{field} must be between {} and {}, got {v}",
            range.start(),
            range.end()
        ))),
        _ => Ok(()),
    }
}

// ABOUTME: Analysis request and result types shared by scheduler, normalizer and API
//
// A request names a position, one or more engines and exactly one budget kind.
// Every (request, engine) pair yields exactly one AnalysisResult, whatever
// happened to the engine: completed, timed-out, engine-error or cancelled.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::protocol::SearchBudget;

/// Identifier assigned to a request at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Analysis request as submitted to the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    /// Position notation (`startpos`, `fen ...`, bare FEN, optional `moves`)
    pub position: String,
    /// Target engine names
    pub engines: Vec<String>,
    /// Node budget
    pub nodes: Option<u64>,
    /// Depth budget
    pub depth: Option<u32>,
    /// Time budget
    pub time: Option<Duration>,
    /// Candidate lines wanted per engine
    pub max_moves: u32,
}

/// Budget selection failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BudgetError {
    /// None of nodes, depth, time set
    #[error("No search budget set: exactly one of nodes, depth or time is required")]
    Missing,
    /// More than one set
    #[error("Conflicting search budgets: exactly one of nodes, depth or time is allowed")]
    Conflicting,
    /// A zero budget
    #[error("Search budget must be greater than zero")]
    Zero,
}

impl AnalysisRequest {
    /// Request for a single engine with a node budget
    pub fn nodes(position: impl Into<String>, engine: impl Into<String>, nodes: u64, max_moves: u32) -> Self {
        Self {
            position: position.into(),
            engines: vec![engine.into()],
            nodes: Some(nodes),
            depth: None,
            time: None,
            max_moves,
        }
    }

    /// The single budget kind this request sets
    pub fn budget(&self) -> Result<SearchBudget, BudgetError> {
        let budget = match (self.nodes, self.depth, self.time) {
            (Some(nodes), None, None) => SearchBudget::Nodes(nodes),
            (None, Some(depth), None) => SearchBudget::Depth(depth),
            (None, None, Some(time)) => SearchBudget::Time(time),
            (None, None, None) => return Err(BudgetError::Missing),
            _ => return Err(BudgetError::Conflicting),
        };
        let zero = match budget {
            SearchBudget::Nodes(n) => n == 0,
            SearchBudget::Depth(d) => d == 0,
            SearchBudget::Time(t) => t.is_zero(),
        };
        if zero { Err(BudgetError::Zero) } else { Ok(budget) }
    }
}

/// Completion status of one (request, engine) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisStatus {
    /// Engine finished and its output normalized cleanly
    Completed,
    /// Engine did not finish before its deadline
    TimedOut,
    /// Engine failed, was unavailable, or produced malformed output
    EngineError,
    /// Request was cancelled before this engine finished
    Cancelled,
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed-out",
            Self::EngineError => "engine-error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Win/draw/loss probabilities in per mille, side to move's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wdl {
    /// Win
    pub win: u32,
    /// Draw
    pub draw: u32,
    /// Loss
    pub loss: u32,
}

/// Engine-independent evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Signed centipawns; mates are mapped to `±(10000 − |N|)`
    pub cp: i32,
    /// Mate distance in moves when the score is a forced mate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mate: Option<i32>,
    /// Outcome probabilities
    pub wdl: Wdl,
}

/// One normalized candidate line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateLine {
    /// 1 = best
    pub rank: u32,
    /// Principal variation, canonical UCI
    pub moves: Vec<String>,
    /// Principal variation, SAN
    pub san: Vec<String>,
    /// Evaluation of this line
    pub evaluation: Evaluation,
    /// Depth reached
    pub depth: u32,
    /// Selective depth, when reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seldepth: Option<u32>,
    /// Nodes searched when the line was reported
    pub nodes: u64,
}

/// Aggregate numbers for one engine's search
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchStats {
    /// Total nodes
    pub nodes: u64,
    /// Maximum depth
    pub depth: u32,
    /// Maximum selective depth
    pub seldepth: u32,
    /// Engine-reported search time
    pub time_ms: u64,
    /// Engine-reported speed
    pub nps: u64,
}

/// Result for one (request, engine) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Owning request
    pub request_id: RequestId,
    /// Engine name
    pub engine: String,
    /// Completion status
    pub status: AnalysisStatus,
    /// Ranked candidate lines; empty unless completed
    pub candidates: Vec<CandidateLine>,
    /// Engine's chosen move, canonical UCI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_move: Option<String>,
    /// Engine's chosen move, SAN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_move_san: Option<String>,
    /// Evaluation of the top candidate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
    /// Search totals
    pub stats: SearchStats,
    /// Wall-clock time from dispatch to result
    pub elapsed_ms: u64,
    /// Failure description for non-completed results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalysisResult {
    /// Result carrying no analysis, for any non-completed status
    pub fn failed(
        request_id: RequestId,
        engine: impl Into<String>,
        status: AnalysisStatus,
        error: Option<String>,
    ) -> Self {
        Self {
            request_id,
            engine: engine.into(),
            status,
            candidates: Vec::new(),
            best_move: None,
            best_move_san: None,
            evaluation: None,
            stats: SearchStats::default(),
            elapsed_ms: 0,
            error,
        }
    }

    /// Result for an engine that missed its deadline
    pub fn timed_out(request_id: RequestId, engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failed(request_id, engine, AnalysisStatus::TimedOut, Some(message.into()))
    }

    /// Result for an engine failure or malformed output
    pub fn engine_error(request_id: RequestId, engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failed(request_id, engine, AnalysisStatus::EngineError, Some(message.into()))
    }

    /// Result for a cancelled pair
    pub fn cancelled(request_id: RequestId, engine: impl Into<String>) -> Self {
        Self::failed(request_id, engine, AnalysisStatus::Cancelled, None)
    }

    /// Record elapsed wall-clock time
    #[must_use]
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// Merged per-engine results of one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// Request id
    pub request_id: RequestId,
    /// FEN of the analyzed position
    pub fen: String,
    /// One result per targeted engine, in request order
    pub results: Vec<AnalysisResult>,
}

impl AggregateResult {
    /// Whether every engine completed
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.status == AnalysisStatus::Completed)
    }

    /// Result for one engine
    #[must_use]
    pub fn result_for(&self, engine: &str) -> Option<&AnalysisResult> {
        self.results.iter().find(|r| r.engine == engine)
    }
}

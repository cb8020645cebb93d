// ABOUTME: Multi-engine chess analysis orchestrator over UCI subprocesses
//
// Owns the engine processes (lc0 on the GPU, Stockfish and Maia on the CPU),
// speaks the line-based UCI protocol to each, schedules analysis requests
// across them with per-engine concurrency limits and returns normalized,
// comparable results.
//
// Key components:
// - line_buffer: incremental byte-chunk to line framing
// - process: engine subprocess handle with launch probe and graceful termination
// - grammar: per-engine output grammar (lc0, stockfish)
// - position: local position and move validation (cozy-chess)
// - protocol: UCI session state machine
// - pool: engine slots, launch and restart
// - backpressure: bounded per-engine FIFO queues
// - scheduler: dispatch, fan-out, cancellation and aggregate deadline
// - normalizer: common score scale and move notation
// - health: liveness and isready probes, readiness report
//
//   request ─▶ AnalysisScheduler ─▶ EngineQueue ─▶ worker ─▶ ProtocolSession ─▶ EngineProcess
//                                                     │
//                                                     ▼
//                                             normalize_result ─▶ AggregateResult
//
//   HealthMonitor ─▶ EnginePool (liveness, ping, restart)

pub mod analysis;
pub mod backpressure;
pub mod config;
pub mod descriptor;
pub mod grammar;
pub mod health;
pub mod line_buffer;
pub mod metrics;
pub mod normalizer;
pub mod pool;
pub mod position;
pub mod process;
pub mod protocol;
pub mod scheduler;

// Re-exports for convenient access
pub use analysis::{
    AggregateResult, AnalysisRequest, AnalysisResult, AnalysisStatus, CandidateLine, Evaluation,
    RequestId, SearchStats, Wdl,
};
pub use config::{HealthConfig, PoolConfig, SchedulerConfig};
pub use descriptor::{EngineDescriptor, EngineKind, ScoreScale};
pub use health::{HealthMonitor, HealthReport, Readiness};
pub use pool::{EnginePool, PoolError, PoolResult};
pub use protocol::{SearchBudget, SessionError, SessionTimeouts};
pub use scheduler::{AnalysisHandle, AnalysisScheduler, SchedulerError};

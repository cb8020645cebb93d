// ABOUTME: Counters for request outcomes and engine restarts
//
// Tracks:
// - Requests: submitted, rejected by backpressure
// - Results: completed, failed, timed out, cancelled
// - Engines: in-flight searches, restarts

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use super::analysis::AnalysisStatus;

/// Service-level metrics
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Requests admitted
    pub submitted: AtomicU64,
    /// Requests rejected as overloaded
    pub rejected: AtomicU64,
    /// Engine results completed
    pub completed: AtomicU64,
    /// Engine results failed
    pub failed: AtomicU64,
    /// Engine results timed out
    pub timed_out: AtomicU64,
    /// Engine results cancelled
    pub cancelled: AtomicU64,
    /// Engine process restarts
    pub restarts: AtomicU64,
}

impl PoolMetrics {
    /// Zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an admitted request
    pub fn request_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a rejected request
    pub fn request_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an engine restart
    pub fn engine_restarted(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one per-engine result by its terminal status
    pub fn record_result(&self, status: AnalysisStatus) {
        let counter = match status {
            AnalysisStatus::Completed => &self.completed,
            AnalysisStatus::TimedOut => &self.timed_out,
            AnalysisStatus::EngineError => &self.failed,
            AnalysisStatus::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

/// Per-engine metrics
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Searches running now
    pub in_flight: AtomicU32,
    /// Searches dispatched
    pub searches_total: AtomicU64,
    /// Searches that ended in error or timeout
    pub errors_total: AtomicU64,
    /// Entries waiting in the queue
    pub queue_depth: AtomicUsize,
}

impl EngineMetrics {
    /// Zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// A search was dispatched
    pub fn search_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.searches_total.fetch_add(1, Ordering::Relaxed);
    }

    /// A search finished normally
    pub fn search_completed(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// A search failed or timed out
    pub fn search_failed(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Searches running now
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Record the queue length
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    /// Last recorded queue length
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of the service counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests admitted
    pub submitted: u64,
    /// Requests rejected as overloaded
    pub rejected: u64,
    /// Engine results completed
    pub completed: u64,
    /// Engine results failed
    pub failed: u64,
    /// Engine results timed out
    pub timed_out: u64,
    /// Engine results cancelled
    pub cancelled: u64,
    /// Engine process restarts
    pub restarts: u64,
}

// ABOUTME: Service configuration: engines, default budgets and orchestrator tunables
// Loaded from TOML by precedence, then overridden from the environment

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::engine_pool::{
    AnalysisRequest, EngineDescriptor, EngineKind, HealthConfig, PoolConfig, SchedulerConfig,
    SessionTimeouts,
};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "CHESS_ENGINE_SERVICE_CONFIG";

/// Config file name looked up in the working directory
const LOCAL_CONFIG_FILE: &str = "chess-engine-service.toml";

/// Errors found by `ServiceConfig::validate`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Two engines share a name
    #[error("Engine '{0}' is configured more than once")]
    DuplicateEngine(String),

    /// `concurrency_limit` is zero
    #[error("Engine '{0}' must allow at least one concurrent search")]
    ZeroConcurrency(String),

    /// Engine name is blank
    #[error("Engine name must not be empty")]
    EmptyEngineName,

    /// A count or duration that must be positive is zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// Default `movetime` cannot finish before the aggregate deadline
    #[error("defaults.time_ms {time_ms} leaves no room before the aggregate deadline (at most {limit_ms})")]
    TimeBudgetPastDeadline {
        /// Configured default
        time_ms: u64,
        /// Largest value that fits
        limit_ms: u64,
    },
}

/// Which budget kind fills in a request that names none
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetKind {
    /// `nodes`
    #[default]
    Nodes,
    /// `depth`
    Depth,
    /// `time_ms`
    Time,
}

/// Default search budget values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisDefaults {
    /// Budget kind used when a request names none
    pub budget_kind: BudgetKind,
    /// Default node budget
    pub nodes: u64,
    /// Default depth budget
    pub depth: u32,
    /// Default time budget in milliseconds
    pub time_ms: u64,
    /// Candidate moves when the request names none; also each engine's
    /// configured MultiPV
    pub num_moves: u32,
}

impl Default for AnalysisDefaults {
    fn default() -> Self {
        Self {
            budget_kind: BudgetKind::Nodes,
            nodes: 100_000,
            depth: 20,
            time_ms: 1_000,
            num_moves: 10,
        }
    }
}

impl AnalysisDefaults {
    /// Fill in the default budget if the request sets none
    pub fn apply_budget(&self, request: &mut AnalysisRequest) {
        if request.nodes.is_some() || request.depth.is_some() || request.time.is_some() {
            return;
        }
        match self.budget_kind {
            BudgetKind::Nodes => request.nodes = Some(self.nodes),
            BudgetKind::Depth => request.depth = Some(self.depth),
            BudgetKind::Time => request.time = Some(Duration::from_millis(self.time_ms)),
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Bind address for the outer HTTP collaborator
    pub host: String,

    /// Port for the outer HTTP collaborator
    pub port: u16,

    /// Human-readable debug logging
    pub debug: bool,

    /// Engines in listing order
    pub engines: Vec<EngineDescriptor>,

    /// Fallback budget and candidate count
    pub defaults: AnalysisDefaults,
    /// Engine supervision tunables
    pub pool: PoolConfig,
    /// Queueing and deadline tunables
    pub scheduler: SchedulerConfig,
    /// Health probe tunables
    pub health: HealthConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            debug: false,
            engines: vec![
                EngineDescriptor::lc0_default(),
                EngineDescriptor::maia_default(),
                EngineDescriptor::stockfish_default(),
            ],
            defaults: AnalysisDefaults::default(),
            pool: PoolConfig::default(),
            scheduler: SchedulerConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load from the first config file found, apply environment overrides
    /// and validate
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match Self::find_config_file(explicit)? {
            Some(path) => Self::load_from_file(&path)?,
            None => {
                debug!("No config file found, using built-in defaults");
                Self::default()
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse one TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        info!(path = %path.display(), engines = config.engines.len(), "Loaded configuration");
        Ok(config)
    }

    /// Resolve the config file by precedence; an explicit path must exist
    fn find_config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            anyhow::ensure!(path.exists(), "Config file not found: {}", path.display());
            return Ok(Some(path.to_path_buf()));
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            anyhow::ensure!(
                path.exists(),
                "Config file from {CONFIG_ENV} not found: {}",
                path.display()
            );
            return Ok(Some(path));
        }
        Ok(Self::get_config_paths().into_iter().find(|p| p.exists()))
    }

    /// Implicit configuration file paths in order of precedence
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![];

        // 1. Working directory
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd.join(LOCAL_CONFIG_FILE));
        }

        // 2. User config
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("chess-engine-service").join("config.toml"));
        }

        // 3. System config
        paths.push(PathBuf::from("/etc/chess-engine-service/config.toml"));

        paths
    }

    /// Apply the deployment's environment variables
    ///
    /// `LC0_PATH` is the binary shared by the neural engines, `LC0_NETWORK`
    /// and `MAIA_NETWORK` their weight files, `STOCKFISH_PATH` the search
    /// engine binary.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for engine in &mut self.engines {
            match engine.kind {
                EngineKind::GpuNeural => {
                    if let Some(path) = lookup("LC0_PATH") {
                        engine.executable = PathBuf::from(path);
                    }
                    if let Some(network) = lookup("LC0_NETWORK") {
                        engine.weights = Some(PathBuf::from(network));
                    }
                }
                EngineKind::HumanLike => {
                    if let Some(path) = lookup("LC0_PATH") {
                        engine.executable = PathBuf::from(path);
                    }
                    if let Some(network) = lookup("MAIA_NETWORK") {
                        engine.weights = Some(PathBuf::from(network));
                    }
                }
                EngineKind::CpuSearch => {
                    if let Some(path) = lookup("STOCKFISH_PATH") {
                        engine.executable = PathBuf::from(path);
                    }
                }
            }
        }

        if let Some(host) = lookup("HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Some(debug) = lookup("DEBUG") {
            self.debug = matches!(debug.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
    }

    /// Check invariants the orchestrator relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for engine in &self.engines {
            if engine.name.trim().is_empty() {
                return Err(ConfigError::EmptyEngineName);
            }
            if !names.insert(engine.name.as_str()) {
                return Err(ConfigError::DuplicateEngine(engine.name.clone()));
            }
            if engine.concurrency_limit == 0 {
                return Err(ConfigError::ZeroConcurrency(engine.name.clone()));
            }
        }

        let nonzero_counts = [
            (
                "scheduler.max_queue_depth",
                u64::try_from(self.scheduler.max_queue_depth).unwrap_or(u64::MAX),
            ),
            ("pool.restart_retry_limit", u64::from(self.pool.restart_retry_limit)),
            ("defaults.nodes", self.defaults.nodes),
            ("defaults.depth", u64::from(self.defaults.depth)),
            ("defaults.time_ms", self.defaults.time_ms),
            ("defaults.num_moves", u64::from(self.defaults.num_moves)),
        ];
        let nonzero_durations = [
            ("pool.restart_timeout_ms", self.pool.restart_timeout),
            ("pool.handshake_timeout_ms", self.pool.handshake_timeout),
            ("pool.terminate_grace_ms", self.pool.terminate_grace),
            ("scheduler.request_timeout_ms", self.scheduler.request_timeout),
            ("scheduler.aggregate_deadline_ms", self.scheduler.aggregate_deadline),
            ("health.probe_interval_ms", self.health.probe_interval),
            ("health.probe_timeout_ms", self.health.probe_timeout),
        ];
        if let Some(&(name, _)) = nonzero_counts.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(name));
        }
        if let Some(&(name, _)) = nonzero_durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Zero(name));
        }
        let limit_ms = self.max_time_budget_ms();
        if self.defaults.time_ms > limit_ms {
            return Err(ConfigError::TimeBudgetPastDeadline {
                time_ms: self.defaults.time_ms,
                limit_ms,
            });
        }
        Ok(())
    }

    /// Longest `movetime` that still finishes, grace included, before the
    /// aggregate deadline
    #[must_use]
    pub fn max_time_budget_ms(&self) -> u64 {
        let room = self
            .scheduler
            .aggregate_deadline
            .saturating_sub(self.pool.search_grace);
        u64::try_from(room.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_sub(1)
    }

    /// Timeouts handed to every protocol session
    #[must_use]
    pub const fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            handshake: self.pool.handshake_timeout,
            search_grace: self.pool.search_grace,
            request_timeout: self.scheduler.request_timeout,
        }
    }
}

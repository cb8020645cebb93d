// ABOUTME: Shared fixtures for orchestration tests
//
// Provides:
// - FakeEngine: scripted UCI engine in a temp dir, one command log per engine
// - Mode: what the fake does when asked to search or ping
// - Harness: started pool + scheduler over fake engines
// - eventually(): poll a condition with a deadline

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

use chess_engine_service::config::ServiceConfig;
use chess_engine_service::engine_pool::metrics::PoolMetrics;
use chess_engine_service::engine_pool::{
    AnalysisScheduler, EngineDescriptor, EngineKind, EnginePool, PoolConfig, SchedulerConfig,
    SessionTimeouts,
};

/// Fake engine behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Four ranked lines for the start position, then `bestmove`
    Normal,
    /// Never answers `go`, ignores `stop`
    Hang,
    /// Exits as soon as it is asked to search
    Die,
    /// One info line, then waits for `stop` before `bestmove`
    WaitStop,
    /// Rejects the `Hash` option during configuration
    Reject,
    /// Reports an illegal principal variation and best move
    Illegal,
    /// Answers the first `isready` only
    HangOnPing,
}

impl Mode {
    const fn as_arg(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Hang => "hang",
            Self::Die => "die",
            Self::WaitStop => "wait_stop",
            Self::Reject => "reject",
            Self::Illegal => "illegal",
            Self::HangOnPing => "hang_on_ping",
        }
    }
}

const SCRIPT: &str = r#"
mode="$1"
log="$2"
ready=0
while read -r cmd rest; do
  echo "$cmd $rest" >> "$log"
  case "$cmd" in
    uci)
      echo "id name FakeUCI 1.0"
      echo "id author test"
      echo "option name MultiPV type spin default 1 min 1 max 500"
      echo "option name Hash type spin default 16 min 1 max 4096"
      echo "uciok" ;;
    isready)
      ready=$((ready + 1))
      if [ "$mode" != "hang_on_ping" ] || [ "$ready" -le 1 ]; then echo "readyok"; fi ;;
    setoption)
      if [ "$mode" = "reject" ]; then
        case "$rest" in *Hash*) echo "No such option: Hash" ;; esac
      fi ;;
    go)
      nodes=$(echo "$rest" | sed -n 's/.*nodes \([0-9][0-9]*\).*/\1/p')
      [ -z "$nodes" ] && nodes=1000
      case "$mode" in
        hang) ;;
        die) exit 3 ;;
        wait_stop) echo "info depth 1 multipv 1 score cp 5 nodes 10 pv e2e4" ;;
        illegal)
          echo "info depth 4 multipv 1 score cp 10 nodes $nodes pv e2e5"
          echo "bestmove e2e5" ;;
        *)
          echo "info depth 12 seldepth 14 multipv 4 score cp 5 nodes $nodes nps 500000 time 200 pv c2c4"
          echo "info depth 12 seldepth 15 multipv 2 score cp 22 nodes $nodes nps 500000 time 200 pv d2d4 d7d5"
          echo "info depth 12 seldepth 16 multipv 1 score cp 30 wdl 400 550 50 nodes $nodes nps 500000 time 200 pv e2e4 e7e5 g1f3"
          echo "info depth 12 seldepth 15 multipv 3 score cp 18 nodes $nodes nps 500000 time 200 pv g1f3 g8f6"
          echo "bestmove e2e4 ponder e7e5" ;;
      esac ;;
    stop)
      if [ "$mode" != "hang" ]; then echo "bestmove e2e4"; fi ;;
    quit) exit 0 ;;
  esac
done
"#;

/// Scripted UCI engine living in a temp dir
pub struct FakeEngine {
    pub dir: TempDir,
    pub script: PathBuf,
}

impl FakeEngine {
    /// Write the script into a fresh temp dir
    pub fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let script = dir.path().join("fake_uci.sh");
        std::fs::write(&script, SCRIPT)?;
        Ok(Self { dir, script })
    }

    /// Descriptor launching the fake under `name` in `mode`
    pub fn descriptor(&self, name: &str, mode: Mode) -> EngineDescriptor {
        let mut descriptor = EngineDescriptor::new(name, EngineKind::CpuSearch, "sh");
        descriptor.args = vec![
            self.script.display().to_string(),
            mode.as_arg().to_string(),
            self.log_path(name).display().to_string(),
        ];
        descriptor
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(format!("{name}.log"))
    }

    /// Every command engine `name` received, across restarts
    pub fn commands(&self, name: &str) -> Vec<String> {
        std::fs::read_to_string(self.log_path(name))
            .unwrap_or_default()
            .lines()
            .map(|line| line.trim().to_string())
            .collect()
    }

    /// Commands of engine `name` starting with `prefix`
    pub fn commands_starting(&self, name: &str, prefix: &str) -> Vec<String> {
        self.commands(name)
            .into_iter()
            .filter(|line| line.starts_with(prefix))
            .collect()
    }

    /// How often engine `name` received exactly `command`
    pub fn count(&self, name: &str, command: &str) -> usize {
        self.commands(name).iter().filter(|line| *line == command).count()
    }

    /// Make every further launch fail
    pub fn break_launches(&self) -> Result<()> {
        std::fs::remove_file(&self.script)?;
        Ok(())
    }
}

/// Pool timings short enough for tests
pub fn pool_config() -> PoolConfig {
    PoolConfig {
        restart_retry_limit: 2,
        restart_timeout: Duration::from_secs(2),
        restart_backoff_base: Duration::from_millis(10),
        restart_backoff_max: Duration::from_millis(50),
        handshake_timeout: Duration::from_secs(2),
        search_grace: Duration::from_millis(300),
        terminate_grace: Duration::from_millis(300),
        launch_probe: Duration::from_millis(50),
    }
}

pub fn scheduler_config(max_queue_depth: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_queue_depth,
        request_timeout: Duration::from_secs(5),
        aggregate_deadline: Duration::from_secs(10),
    }
}

pub fn timeouts(request_timeout: Duration) -> SessionTimeouts {
    SessionTimeouts {
        handshake: Duration::from_secs(2),
        search_grace: Duration::from_millis(300),
        request_timeout,
    }
}

/// Service configuration over the given descriptors
pub fn service_config(engines: Vec<EngineDescriptor>) -> ServiceConfig {
    let mut config = ServiceConfig {
        engines,
        ..ServiceConfig::default()
    };
    config.pool = pool_config();
    config.scheduler = scheduler_config(8);
    config
}

/// Started pool and scheduler
pub struct Harness {
    pub scheduler: AnalysisScheduler,
}

impl Harness {
    /// Start engines with default queue depth and request timeout
    pub async fn start(engines: Vec<EngineDescriptor>) -> Self {
        Self::start_with(engines, scheduler_config(8)).await
    }

    pub async fn start_with(engines: Vec<EngineDescriptor>, config: SchedulerConfig) -> Self {
        let pool = Arc::new(
            EnginePool::new(
                engines,
                pool_config(),
                timeouts(config.request_timeout),
                4,
                Arc::new(PoolMetrics::new()),
            )
            .expect("valid engine table"),
        );
        pool.start().await;
        Self {
            scheduler: AnalysisScheduler::start(pool, config),
        }
    }

    pub fn pool(&self) -> &Arc<EnginePool> {
        self.scheduler.pool()
    }

    /// Pid of the first slot of `engine`
    pub fn pid(&self, engine: &str) -> Option<u32> {
        self.pool().handle(engine)?.slots().first()?.pid()
    }

    pub async fn stop(self) {
        self.scheduler.shutdown().await;
        self.scheduler.pool().shutdown().await;
    }
}

/// Poll `condition` every 20ms until it holds or `limit` passes
pub async fn eventually<F: FnMut() -> bool>(mut condition: F, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

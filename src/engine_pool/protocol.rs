// ABOUTME: UCI protocol session - per-engine state machine over an EngineProcess
//
// State machine:
//
//   Uninitialized ──handshake──▶ Configuring ──configure──▶ Ready ◀──┐
//                                                            │        │ bestmove
//                                                          search     │
//                                                            ▼        │
//                                                        Searching ───┘
//
//   any I/O failure, malformed handshake, search timeout ──▶ Faulted
//
// Faulted never self-recovers; the pool replaces the whole session. The
// session is the only writer to its process's stdin.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, info, warn};

use super::grammar::{EngineLine, InfoLine, OutputGrammar};
use super::position::{Position, PositionError};
use super::process::{EngineProcess, ProcessError, ProcessLiveness, ProcessState};

/// Errors raised by a protocol session
#[derive(Error, Debug)]
pub enum SessionError {
    /// Operation not valid in the current state
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// State the session was in
        state: SessionState,
    },

    /// `uci` exchange failed or produced an error line
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The engine rejected an option
    #[error("Engine rejected option '{option}': {message}")]
    Configuration {
        /// Option name
        option: String,
        /// Engine's rejection line
        message: String,
    },

    /// Position notation is malformed or illegal
    #[error("Invalid position: {0}")]
    InvalidPosition(#[from] PositionError),

    /// No completion marker within the search's wall-clock limit
    #[error("Search timed out after {elapsed:?}")]
    SearchTimeout {
        /// Time waited
        elapsed: Duration,
    },

    /// No reply to a synchronization command within its timeout
    #[error("Engine unresponsive during {operation} after {waited:?}")]
    Unresponsive {
        /// Operation waiting for the reply
        operation: &'static str,
        /// Time waited
        waited: Duration,
    },

    /// Process-level failure (broken pipe, end of stream)
    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl SessionError {
    /// Whether the error means the engine process is unusable and must be
    /// restarted, as opposed to a caller or configuration problem
    #[must_use]
    pub const fn is_engine_failure(&self) -> bool {
        matches!(
            self,
            Self::Handshake(_) | Self::SearchTimeout { .. } | Self::Unresponsive { .. } | Self::Process(_)
        )
    }
}

/// Protocol state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Process started, `uci` not yet sent
    Uninitialized,
    /// `uciok` received, options not yet applied
    Configuring,
    /// Idle, no search in flight
    Ready,
    /// A `go` is in flight
    Searching,
    /// Unusable; requires external restart
    Faulted,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Uninitialized => "uninitialized",
            Self::Configuring => "configuring",
            Self::Ready => "ready",
            Self::Searching => "searching",
            Self::Faulted => "faulted",
        };
        f.write_str(label)
    }
}

/// Search limit; exactly one kind per search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchBudget {
    /// Node count
    Nodes(u64),
    /// Nominal depth in plies
    Depth(u32),
    /// Wall-clock search time
    Time(Duration),
}

impl SearchBudget {
    /// The `go` command for this budget
    #[must_use]
    pub fn go_command(self) -> String {
        match self {
            Self::Nodes(nodes) => format!("go nodes {nodes}"),
            Self::Depth(depth) => format!("go depth {depth}"),
            Self::Time(time) => format!("go movetime {}", time.as_millis()),
        }
    }

    /// Whether reported progress has gone past the budget
    fn exceeded_by(self, info: &InfoLine) -> bool {
        match self {
            Self::Nodes(limit) => info.nodes.is_some_and(|n| n > limit),
            Self::Depth(limit) => info.depth.is_some_and(|d| d > limit),
            Self::Time(_) => false,
        }
    }
}

/// Wall-clock limits applied by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// `uciok` / `readyok` waits during handshake and configuration
    pub handshake: Duration,
    /// Slack on top of a time budget
    pub search_grace: Duration,
    /// Limit for node- and depth-bounded searches
    pub request_timeout: Duration,
}

/// Why a search ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Engine finished on its own
    Completed,
    /// Stopped because reported progress or elapsed time passed the budget
    BudgetExceeded,
    /// Stopped on caller cancellation
    Cancelled,
}

/// Running totals over every `info` line of one search
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawSearchStats {
    /// Highest node count reported
    pub nodes: u64,
    /// Deepest nominal depth reported
    pub depth: u32,
    /// Deepest selective depth reported
    pub seldepth: u32,
    /// Latest engine-reported time
    pub time_ms: u64,
    /// Latest engine-reported speed
    pub nps: u64,
}

impl RawSearchStats {
    fn absorb(&mut self, info: &InfoLine) {
        if let Some(nodes) = info.nodes {
            self.nodes = self.nodes.max(nodes);
        }
        if let Some(depth) = info.depth {
            self.depth = self.depth.max(depth);
        }
        if let Some(seldepth) = info.seldepth {
            self.seldepth = self.seldepth.max(seldepth);
        }
        if let Some(time) = info.time_ms {
            self.time_ms = self.time_ms.max(time);
        }
        if let Some(nps) = info.nps {
            self.nps = nps;
        }
    }
}

/// Raw result of one search, before normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOutcome {
    /// Candidate lines ranked best first, at most `max_moves`
    pub lines: Vec<InfoLine>,
    /// Move from the completion marker
    pub best_move: Option<String>,
    /// Ponder move from the completion marker
    pub ponder: Option<String>,
    /// Why the search ended
    pub stop_reason: StopReason,
    /// Totals across all progress lines
    pub stats: RawSearchStats,
    /// Wall-clock time from `go` to `bestmove`
    pub elapsed: Duration,
}

/// UCI session bound to one engine process
#[derive(Debug)]
pub struct ProtocolSession {
    name: String,
    grammar: OutputGrammar,
    process: EngineProcess,
    state: SessionState,
    timeouts: SessionTimeouts,

    /// `id name` reported during handshake
    engine_id: Option<String>,

    /// Options the engine declared during handshake
    declared_options: Vec<String>,

    /// MultiPV in effect between searches
    configured_multipv: u32,

    /// `stop` already sent for the current search
    stop_sent: bool,

    /// Last position sent; `None` until the first load or after `new_game`
    last_position: Option<Position>,
}

impl ProtocolSession {
    /// Wrap a freshly started process
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        grammar: OutputGrammar,
        process: EngineProcess,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            name: name.into(),
            grammar,
            process,
            state: SessionState::Uninitialized,
            timeouts,
            engine_id: None,
            declared_options: Vec::new(),
            configured_multipv: 1,
            stop_sent: false,
            last_position: None,
        }
    }

    /// Current protocol state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Engine name this session serves
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `id name` reported by the engine
    #[must_use]
    pub fn engine_id(&self) -> Option<&str> {
        self.engine_id.as_deref()
    }

    /// Options the engine declared
    #[must_use]
    pub fn declared_options(&self) -> &[String] {
        &self.declared_options
    }

    /// Whether the underlying process is running
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.process.is_alive()
    }

    /// Liveness probe of the underlying process
    #[must_use]
    pub fn liveness(&self) -> ProcessLiveness {
        self.process.liveness()
    }

    /// `uci` → `uciok`; moves Uninitialized → Configuring
    pub async fn handshake(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::Uninitialized, "handshake")?;
        self.send("uci").await?;

        let deadline = Instant::now() + self.timeouts.handshake;
        loop {
            let Some(line) = self.recv_until(deadline).await? else {
                self.fault("no uciok before handshake timeout");
                return Err(SessionError::Handshake(format!(
                    "no uciok within {:?}",
                    self.timeouts.handshake
                )));
            };
            match line {
                EngineLine::UciOk => break,
                EngineLine::IdName(id) => self.engine_id = Some(id),
                EngineLine::OptionDecl(option) => self.declared_options.push(option),
                EngineLine::Error(message) => {
                    self.fault("error line during handshake");
                    return Err(SessionError::Handshake(message));
                }
                _ => {}
            }
        }

        info!(
            engine = %self.name,
            id = self.engine_id.as_deref().unwrap_or("unknown"),
            options = self.declared_options.len(),
            "Engine handshake complete"
        );
        self.state = SessionState::Configuring;
        Ok(())
    }

    /// Apply startup options; moves Configuring → Ready
    ///
    /// Sends one `setoption` per option, then synchronizes with `isready`.
    /// A rejection line seen before `readyok` fails the whole configuration.
    pub async fn configure(&mut self, options: &[(String, String)]) -> Result<(), SessionError> {
        self.expect_state(SessionState::Configuring, "configure")?;

        for (name, value) in options {
            self.send(&format!("setoption name {name} value {value}")).await?;
            if name.eq_ignore_ascii_case("MultiPV") {
                self.configured_multipv = value.parse().unwrap_or(1);
            }
        }

        let rejections = self.sync("configure", self.timeouts.handshake).await?;
        if let Some(message) = rejections.into_iter().next() {
            let option = options
                .iter()
                .map(|(name, _)| name)
                .filter(|name| message.to_lowercase().contains(&name.to_lowercase()))
                .max_by_key(|name| name.len())
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            warn!(engine = %self.name, option = %option, message = %message, "Engine rejected option");
            return Err(SessionError::Configuration { option, message });
        }

        self.state = SessionState::Ready;
        debug!(engine = %self.name, multipv = self.configured_multipv, "Engine configured");
        Ok(())
    }

    /// Validate a position locally, then send it; valid only in Ready
    ///
    /// Nothing is written to the engine when the notation is invalid.
    /// `ucinewgame` precedes any position that does not continue the
    /// previously loaded one.
    pub async fn load_position(&mut self, notation: &str) -> Result<Position, SessionError> {
        self.expect_state(SessionState::Ready, "load position")?;
        let position = Position::parse(notation)?;

        let same_game = self
            .last_position
            .as_ref()
            .is_some_and(|earlier| position.continues(earlier));
        if !same_game {
            self.send("ucinewgame").await?;
        }
        self.send(&position.uci_command()).await?;
        // Also drains any completion marker a previous search left behind
        self.sync("load position", self.timeouts.handshake).await?;
        self.last_position = Some(position.clone());
        Ok(position)
    }

    /// Reset the engine's game state (`ucinewgame` + `isready`); valid only in Ready
    pub async fn new_game(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::Ready, "new game")?;
        self.send("ucinewgame").await?;
        self.sync("new game", self.timeouts.handshake).await?;
        self.last_position = None;
        Ok(())
    }

    /// Run one search; valid only in Ready
    ///
    /// Retains the latest candidate line per MultiPV index, sends `stop`
    /// when the budget is exceeded or `cancel` flips to true, and returns on
    /// `bestmove`. Lines are ranked by score, ties in first-seen order.
    pub async fn search(
        &mut self,
        budget: SearchBudget,
        max_moves: u32,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<SearchOutcome, SessionError> {
        self.expect_state(SessionState::Ready, "search")?;
        let max_moves = max_moves.max(1);

        let restore_multipv = if max_moves == self.configured_multipv {
            None
        } else {
            self.send(&format!("setoption name MultiPV value {max_moves}"))
                .await?;
            Some(self.configured_multipv)
        };

        self.send(&budget.go_command()).await?;
        self.state = SessionState::Searching;
        self.stop_sent = false;

        let started = Instant::now();
        let wall_limit = match budget {
            SearchBudget::Time(time) => time + self.timeouts.search_grace,
            SearchBudget::Nodes(_) | SearchBudget::Depth(_) => self.timeouts.request_timeout,
        };
        let hard_deadline = started + wall_limit;
        let budget_deadline = match budget {
            SearchBudget::Time(time) => started + time,
            SearchBudget::Nodes(_) | SearchBudget::Depth(_) => hard_deadline,
        };
        let has_time_budget = matches!(budget, SearchBudget::Time(_));

        let mut stop_reason = StopReason::Completed;
        if *cancel.borrow_and_update() {
            stop_reason = StopReason::Cancelled;
            self.stop().await?;
        }

        let mut candidates: Vec<InfoLine> = Vec::new();
        let mut stats = RawSearchStats::default();
        let mut cancel_open = true;

        let (best_move, ponder) = loop {
            let watch_cancel = cancel_open && !self.stop_sent;
            let watch_budget_clock = has_time_budget && !self.stop_sent;

            tokio::select! {
                changed = cancel.changed(), if watch_cancel => {
                    match changed {
                        Ok(()) if *cancel.borrow_and_update() => {
                            debug!(engine = %self.name, "Search cancelled, stopping engine");
                            stop_reason = StopReason::Cancelled;
                            self.stop().await?;
                        }
                        Ok(()) => {}
                        Err(_) => cancel_open = false,
                    }
                }
                () = sleep_until(budget_deadline), if watch_budget_clock => {
                    stop_reason = StopReason::BudgetExceeded;
                    self.stop().await?;
                }
                read = timeout_at(hard_deadline, self.process.read_line()) => {
                    let line = match read {
                        Ok(Ok(line)) => line,
                        Ok(Err(e)) => {
                            self.fault("read failed during search");
                            return Err(e.into());
                        }
                        Err(_) => {
                            let elapsed = started.elapsed();
                            self.fault("no completion marker before deadline");
                            return Err(SessionError::SearchTimeout { elapsed });
                        }
                    };

                    match self.grammar.parse_line(&line) {
                        EngineLine::Info(info) => {
                            stats.absorb(&info);
                            let over_budget = budget.exceeded_by(&info);
                            if info.is_candidate() {
                                retain_candidate(&mut candidates, info);
                            }
                            if over_budget && !self.stop_sent {
                                stop_reason = StopReason::BudgetExceeded;
                                self.stop().await?;
                            }
                        }
                        EngineLine::BestMove { best, ponder } => break (best, ponder),
                        EngineLine::Error(message) => {
                            warn!(engine = %self.name, message = %message, "Engine error during search");
                        }
                        _ => {}
                    }
                }
            }
        };

        self.state = SessionState::Ready;
        self.stop_sent = false;

        if let Some(multipv) = restore_multipv {
            self.send(&format!("setoption name MultiPV value {multipv}"))
                .await?;
        }

        rank_candidates(&mut candidates);
        candidates.truncate(max_moves as usize);

        let elapsed = started.elapsed();
        debug!(
            engine = %self.name,
            lines = candidates.len(),
            nodes = stats.nodes,
            depth = stats.depth,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "Search finished"
        );

        Ok(SearchOutcome {
            lines: candidates,
            best_move,
            ponder,
            stop_reason,
            stats,
            elapsed,
        })
    }

    /// Ask the engine to end the current search; valid only in Searching
    ///
    /// Sends at most one `stop` per search. The next `bestmove` answers the
    /// in-flight search.
    pub async fn stop(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::Searching, "stop")?;
        if self.stop_sent {
            return Ok(());
        }
        self.stop_sent = true;
        self.send("stop").await
    }

    /// Lightweight `isready` round-trip; valid only in Ready
    ///
    /// A missing `readyok` faults the session.
    pub async fn ping(&mut self, limit: Duration) -> Result<Duration, SessionError> {
        self.expect_state(SessionState::Ready, "ping")?;
        let started = Instant::now();
        self.sync("ping", limit).await?;
        Ok(started.elapsed())
    }

    /// Send `quit`, then terminate the process within `grace`
    pub async fn quit(mut self, grace: Duration) -> ProcessState {
        if self.process.is_alive() && self.state != SessionState::Faulted {
            let _ = self.process.write_line("quit").await;
            self.process.wait_for_exit(grace).await;
        }
        self.process.terminate(grace).await
    }

    /// Terminate without the `quit` courtesy (hung or faulted engines)
    pub async fn terminate(self, grace: Duration) -> ProcessState {
        self.process.terminate(grace).await
    }

    fn expect_state(&self, expected: SessionState, operation: &'static str) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn fault(&mut self, reason: &str) {
        if self.state != SessionState::Faulted {
            warn!(engine = %self.name, from = %self.state, reason = reason, "Session faulted");
        }
        self.state = SessionState::Faulted;
    }

    async fn send(&mut self, line: &str) -> Result<(), SessionError> {
        if let Err(e) = self.process.write_line(line).await {
            self.fault("write failed");
            return Err(e.into());
        }
        Ok(())
    }

    /// Next classified line, or `None` once `deadline` passes
    async fn recv_until(&mut self, deadline: Instant) -> Result<Option<EngineLine>, SessionError> {
        match timeout_at(deadline, self.process.read_line()).await {
            Ok(Ok(line)) => Ok(Some(self.grammar.parse_line(&line))),
            Ok(Err(e)) => {
                self.fault("read failed");
                Err(e.into())
            }
            Err(_) => Ok(None),
        }
    }

    /// `isready` → `readyok`, returning rejection lines seen on the way
    async fn sync(&mut self, operation: &'static str, limit: Duration) -> Result<Vec<String>, SessionError> {
        self.send("isready").await?;
        let deadline = Instant::now() + limit;
        let mut rejections = Vec::new();

        loop {
            match self.recv_until(deadline).await? {
                Some(EngineLine::ReadyOk) => return Ok(rejections),
                Some(EngineLine::Error(message)) => rejections.push(message),
                Some(EngineLine::BestMove { .. }) => {
                    debug!(engine = %self.name, "Ignoring stray completion marker");
                }
                Some(_) => {}
                None => {
                    self.fault("no readyok before timeout");
                    return Err(SessionError::Unresponsive {
                        operation,
                        waited: limit,
                    });
                }
            }
        }
    }
}

/// Keep the newest line per MultiPV index, preserving first-seen order
fn retain_candidate(candidates: &mut Vec<InfoLine>, info: InfoLine) {
    let index = info.candidate_index();
    if let Some(existing) = candidates.iter_mut().find(|c| c.candidate_index() == index) {
        *existing = info;
    } else {
        candidates.push(info);
    }
}

/// Best score first; the sort is stable so ties keep first-seen order
fn rank_candidates(candidates: &mut [InfoLine]) {
    candidates.sort_by_key(|line| {
        std::cmp::Reverse(line.score.map_or(i64::MIN, super::grammar::RawScore::rank_key))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_pool::grammar::RawScore;
    use crate::engine_pool::process::LaunchSpec;
    use std::collections::HashMap;
    use std::path::PathBuf;

    /// Minimal scripted engine; `$1` selects the behaviour of `go`
    const FAKE: &str = r#"
mode="$1"
while read -r cmd rest; do
  case "$cmd" in
    uci)
      echo "Fake engine banner"
      echo "id name Fake 1.0"
      echo "option name MultiPV type spin default 1 min 1 max 500"
      echo "uciok" ;;
    isready) echo "readyok" ;;
    setoption)
      case "$rest" in *Bogus*) echo "No such option: Bogus" ;; esac ;;
    go)
      case "$mode" in
        hang) ;;
        wait_stop) echo "info depth 1 multipv 1 score cp 5 nodes 10 pv e2e4" ;;
        dup)
          echo "info depth 1 multipv 1 score cp 5 nodes 10 pv e2e4"
          echo "bestmove e2e4"
          echo "bestmove e2e4" ;;
        *)
          echo "info string warming up"
          echo "info depth 3 multipv 1 score cp 10 nodes 100 pv e2e4 e7e5"
          echo "info depth 3 multipv 2 score cp 40 nodes 200 pv d2d4 d7d5"
          echo "info depth 3 multipv 3 score cp 10 nodes 300 pv g1f3"
          echo "info depth 4 multipv 1 score cp 12 lowerbound nodes 350 pv e2e4"
          echo "something unexpected"
          echo "bestmove d2d4 ponder d7d5" ;;
      esac ;;
    stop) echo "bestmove e2e4" ;;
    quit) exit 0 ;;
  esac
done
"#;

    fn timeouts() -> SessionTimeouts {
        SessionTimeouts {
            handshake: Duration::from_secs(5),
            search_grace: Duration::from_millis(300),
            request_timeout: Duration::from_millis(800),
        }
    }

    async fn session(mode: &str) -> ProtocolSession {
        let spec = LaunchSpec {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), FAKE.to_string(), "fake".to_string(), mode.to_string()],
            env: HashMap::new(),
            launch_probe: Duration::from_millis(50),
        };
        let process = EngineProcess::start("fake", &spec).await.unwrap();
        ProtocolSession::new("fake", OutputGrammar::Stockfish, process, timeouts())
    }

    async fn ready_session(mode: &str) -> ProtocolSession {
        let mut session = session(mode).await;
        session.handshake().await.unwrap();
        session
            .configure(&[("MultiPV".to_string(), "1".to_string())])
            .await
            .unwrap();
        session
    }

    /// Receiver whose sender is gone; the session stops watching it
    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    // ==================== Lifecycle Tests ====================

    #[tokio::test]
    async fn test_handshake_and_configure() {
        let mut session = session("normal").await;
        assert_eq!(session.state(), SessionState::Uninitialized);

        session.handshake().await.unwrap();
        assert_eq!(session.state(), SessionState::Configuring);
        assert_eq!(session.engine_id(), Some("Fake 1.0"));
        assert_eq!(session.declared_options(), &["MultiPV".to_string()]);

        session
            .configure(&[("Hash".to_string(), "16".to_string())])
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Ready);

        session.quit(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_rejected_option_is_configuration_error() {
        let mut session = session("normal").await;
        session.handshake().await.unwrap();

        let err = session
            .configure(&[
                ("Hash".to_string(), "16".to_string()),
                ("Bogus".to_string(), "1".to_string()),
            ])
            .await
            .unwrap_err();

        match err {
            SessionError::Configuration { option, message } => {
                assert_eq!(option, "Bogus");
                assert!(message.contains("No such option"));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_operations_rejected_in_wrong_state() {
        let mut session = session("normal").await;

        let err = session.load_position("startpos").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                state: SessionState::Uninitialized,
                ..
            }
        ));
        assert!(matches!(
            session.stop().await,
            Err(SessionError::InvalidState { .. })
        ));
        assert!(matches!(
            session.configure(&[]).await,
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_position_sends_nothing() {
        let mut session = ready_session("normal").await;
        let err = session.load_position("fen garbage").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidPosition(_)));
        assert!(!err.is_engine_failure());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_new_game_requires_ready() {
        let mut session = session("normal").await;
        assert!(matches!(
            session.new_game().await,
            Err(SessionError::InvalidState { .. })
        ));

        session.handshake().await.unwrap();
        session.configure(&[]).await.unwrap();
        session.new_game().await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        session.load_position("startpos").await.unwrap();
        session.quit(Duration::from_secs(1)).await;
    }

    // ==================== Search Tests ====================

    #[tokio::test]
    async fn test_search_ranks_and_truncates_candidates() {
        let mut session = ready_session("normal").await;
        session.load_position("startpos").await.unwrap();

        let outcome = session
            .search(SearchBudget::Nodes(1000), 2, &mut no_cancel())
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(outcome.best_move.as_deref(), Some("d2d4"));
        assert_eq!(outcome.ponder.as_deref(), Some("d7d5"));
        assert_eq!(outcome.lines.len(), 2);
        // cp 40 first, then the earlier of the two cp 10 lines
        assert_eq!(outcome.lines[0].score, Some(RawScore::Cp(40)));
        assert_eq!(outcome.lines[1].pv, vec!["e2e4", "e7e5"]);
        // The lowerbound line did not replace multipv 1
        assert_eq!(outcome.lines[1].depth, Some(3));
        assert_eq!(outcome.stats.nodes, 350);
        assert_eq!(outcome.stats.depth, 4);
    }

    #[tokio::test]
    async fn test_duplicate_completion_marker_is_ignored() {
        let mut session = ready_session("dup").await;
        session.load_position("startpos").await.unwrap();
        let first = session
            .search(SearchBudget::Depth(1), 1, &mut no_cancel())
            .await
            .unwrap();
        assert_eq!(first.best_move.as_deref(), Some("e2e4"));

        // The second bestmove is drained by the next position sync
        session.load_position("startpos moves e2e4").await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_search_timeout_faults_session() {
        let mut session = ready_session("hang").await;
        session.load_position("startpos").await.unwrap();

        let err = session
            .search(SearchBudget::Nodes(1000), 1, &mut no_cancel())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::SearchTimeout { .. }));
        assert!(err.is_engine_failure());
        assert_eq!(session.state(), SessionState::Faulted);
        assert!(matches!(
            session.ping(Duration::from_millis(100)).await,
            Err(SessionError::InvalidState { .. })
        ));
        session.terminate(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_time_budget_sends_stop() {
        let mut session = ready_session("wait_stop").await;
        session.load_position("startpos").await.unwrap();

        let outcome = session
            .search(SearchBudget::Time(Duration::from_millis(100)), 1, &mut no_cancel())
            .await
            .unwrap();

        assert_eq!(outcome.stop_reason, StopReason::BudgetExceeded);
        assert_eq!(outcome.best_move.as_deref(), Some("e2e4"));
        assert_eq!(outcome.lines.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_sends_stop() {
        let mut session = ready_session("wait_stop").await;
        session.load_position("startpos").await.unwrap();

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_tx.send(true).unwrap();
            cancel_tx
        });

        let outcome = session
            .search(SearchBudget::Nodes(1_000_000), 1, &mut cancel_rx)
            .await
            .unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert_eq!(session.state(), SessionState::Ready);
        drop(canceller.await.unwrap());
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let mut session = ready_session("normal").await;
        let rtt = session.ping(Duration::from_secs(1)).await.unwrap();
        assert!(rtt < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_engine_death_faults_session() {
        let mut session = ready_session("normal").await;
        let pid = session.liveness().pid();

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            kill(Pid::from_raw(i32::try_from(pid).unwrap()), Signal::SIGKILL).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = session.ping(Duration::from_millis(500)).await.unwrap_err();
        assert!(err.is_engine_failure());
        assert_eq!(session.state(), SessionState::Faulted);
    }

    // ==================== Helper Tests ====================

    #[test]
    fn test_go_commands() {
        assert_eq!(SearchBudget::Nodes(100_000).go_command(), "go nodes 100000");
        assert_eq!(SearchBudget::Depth(20).go_command(), "go depth 20");
        assert_eq!(
            SearchBudget::Time(Duration::from_millis(1500)).go_command(),
            "go movetime 1500"
        );
    }

    #[test]
    fn test_budget_exceeded_by_progress() {
        let info = InfoLine {
            nodes: Some(1500),
            depth: Some(12),
            ..InfoLine::default()
        };
        assert!(SearchBudget::Nodes(1000).exceeded_by(&info));
        assert!(!SearchBudget::Nodes(2000).exceeded_by(&info));
        assert!(SearchBudget::Depth(10).exceeded_by(&info));
        assert!(!SearchBudget::Depth(12).exceeded_by(&info));
        assert!(!SearchBudget::Time(Duration::from_secs(1)).exceeded_by(&info));
    }
}

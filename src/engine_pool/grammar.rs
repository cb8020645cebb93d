// ABOUTME: Engine output grammars - tagged parser dispatch keyed by engine kind
//
// Both lc0 and Stockfish speak UCI, but they differ in how they report
// problems and in which progress lines are worth keeping:
// - lc0 reports errors as lines starting with `error`
// - Stockfish reports `No such option: X` and `Unknown command: 'X'`,
//   and emits `lowerbound`/`upperbound` aspiration lines that are not final
//
// Every grammar produces the same EngineLine type. Lines that match nothing
// come back as Unrecognized and are discarded by the session.

use super::descriptor::EngineKind;

/// Score as reported on an `info` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawScore {
    /// `score cp N` (scale depends on the engine's score type)
    Cp(i32),
    /// `score mate N`, positive when the side to move mates
    Mate(i32),
}

impl RawScore {
    /// Ordering key: mates for the mover first (shorter is better), then
    /// centipawns, then mates against the mover (longer is better)
    #[must_use]
    pub fn rank_key(self) -> i64 {
        const MATE_BAND: i64 = 1_000_000;
        match self {
            Self::Cp(cp) => i64::from(cp),
            Self::Mate(n) if n > 0 => MATE_BAND - i64::from(n),
            Self::Mate(n) => -MATE_BAND - i64::from(n),
        }
    }
}

/// Parsed `info` line; absent fields stay `None`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoLine {
    /// Nominal search depth
    pub depth: Option<u32>,
    /// Selective depth
    pub seldepth: Option<u32>,
    /// 1-based candidate index (`multipv`), absent means 1
    pub multipv: Option<u32>,
    /// Evaluation
    pub score: Option<RawScore>,
    /// Score is only a bound (aspiration window fail high/low)
    pub bound: bool,
    /// Win/draw/loss per mille from `wdl W D L`
    pub wdl: Option<[u32; 3]>,
    /// Nodes searched
    pub nodes: Option<u64>,
    /// Nodes per second
    pub nps: Option<u64>,
    /// Search time in milliseconds
    pub time_ms: Option<u64>,
    /// Principal variation as raw move tokens
    pub pv: Vec<String>,
}

impl InfoLine {
    /// Whether this line describes a complete candidate worth retaining
    #[must_use]
    pub fn is_candidate(&self) -> bool {
        self.score.is_some() && !self.pv.is_empty() && !self.bound
    }

    /// Candidate index with the implicit default of 1
    #[must_use]
    pub fn candidate_index(&self) -> u32 {
        self.multipv.unwrap_or(1)
    }
}

/// One classified line of engine output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineLine {
    /// `id name ...`
    IdName(String),
    /// `id author ...`
    IdAuthor(String),
    /// `option name <name> type ...`
    OptionDecl(String),
    /// `uciok`
    UciOk,
    /// `readyok`
    ReadyOk,
    /// `info ...` with search data
    Info(InfoLine),
    /// `info string ...`
    InfoString(String),
    /// `bestmove <move> [ponder <move>]`; `None` when the engine has no move
    BestMove {
        /// Chosen move, raw token
        best: Option<String>,
        /// Expected reply, raw token
        ponder: Option<String>,
    },
    /// Engine-specific rejection of a command or option
    Error(String),
    /// Anything else
    Unrecognized,
}

/// Output grammar family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputGrammar {
    /// Leela Chess Zero (also used for Maia weights)
    Lc0,
    /// Stockfish
    Stockfish,
}

impl OutputGrammar {
    /// Grammar spoken by an engine kind
    #[must_use]
    pub const fn for_kind(kind: EngineKind) -> Self {
        match kind {
            EngineKind::GpuNeural | EngineKind::HumanLike => Self::Lc0,
            EngineKind::CpuSearch => Self::Stockfish,
        }
    }

    /// Classify one line of output
    #[must_use]
    pub fn parse_line(self, line: &str) -> EngineLine {
        let line = line.trim();
        if let Some(message) = self.error_message(line) {
            return EngineLine::Error(message);
        }

        let (keyword, rest) = split_keyword(line);
        match keyword {
            "uciok" => EngineLine::UciOk,
            "readyok" => EngineLine::ReadyOk,
            "id" => parse_id(rest),
            "option" => parse_option(rest),
            "info" => parse_info(rest),
            "bestmove" => parse_bestmove(rest),
            _ => EngineLine::Unrecognized,
        }
    }

    fn error_message(self, line: &str) -> Option<String> {
        match self {
            Self::Lc0 => {
                let (keyword, rest) = split_keyword(line);
                (keyword == "error").then(|| rest.to_string())
            }
            Self::Stockfish => (line.starts_with("No such option")
                || line.starts_with("Unknown command"))
            .then(|| line.to_string()),
        }
    }
}

fn split_keyword(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((keyword, rest)) => (keyword, rest.trim_start()),
        None => (line, ""),
    }
}

fn parse_id(rest: &str) -> EngineLine {
    let (field, value) = split_keyword(rest);
    match field {
        "name" => EngineLine::IdName(value.to_string()),
        "author" => EngineLine::IdAuthor(value.to_string()),
        _ => EngineLine::Unrecognized,
    }
}

fn parse_option(rest: &str) -> EngineLine {
    let (field, value) = split_keyword(rest);
    if field != "name" {
        return EngineLine::Unrecognized;
    }
    // Option names may contain spaces; the name runs up to " type "
    let name = value.split(" type ").next().unwrap_or(value).trim();
    if name.is_empty() {
        EngineLine::Unrecognized
    } else {
        EngineLine::OptionDecl(name.to_string())
    }
}

fn parse_bestmove(rest: &str) -> EngineLine {
    let mut tokens = rest.split_whitespace();
    let best = tokens
        .next()
        .filter(|mv| !matches!(*mv, "(none)" | "0000"))
        .map(str::to_string);
    let ponder = match (tokens.next(), tokens.next()) {
        (Some("ponder"), Some(mv)) => Some(mv.to_string()),
        _ => None,
    };
    EngineLine::BestMove { best, ponder }
}

fn parse_info(rest: &str) -> EngineLine {
    if let Some(text) = rest.strip_prefix("string") {
        return EngineLine::InfoString(text.trim().to_string());
    }

    let mut info = InfoLine::default();
    let mut recognized = false;
    let mut tokens = rest.split_whitespace();

    while let Some(token) = tokens.next() {
        match token {
            "depth" => info.depth = next_number(&mut tokens),
            "seldepth" => info.seldepth = next_number(&mut tokens),
            "multipv" => info.multipv = next_number(&mut tokens),
            "nodes" => info.nodes = next_number(&mut tokens),
            "nps" => info.nps = next_number(&mut tokens),
            "time" => info.time_ms = next_number(&mut tokens),
            "score" => {
                info.score = match tokens.next() {
                    Some("cp") => next_number(&mut tokens).map(RawScore::Cp),
                    Some("mate") => next_number(&mut tokens).map(RawScore::Mate),
                    _ => None,
                };
            }
            "lowerbound" | "upperbound" => info.bound = true,
            "wdl" => {
                let w = next_number(&mut tokens);
                let d = next_number(&mut tokens);
                let l = next_number(&mut tokens);
                if let (Some(w), Some(d), Some(l)) = (w, d, l) {
                    info.wdl = Some([w, d, l]);
                }
            }
            "pv" => {
                info.pv = tokens.by_ref().map(str::to_string).collect();
            }
            // Fields we have no use for, each followed by one value
            "currmove" | "currmovenumber" | "hashfull" | "tbhits" | "cpuload" | "movesleft"
            | "sbhits" => {
                tokens.next();
            }
            _ => continue,
        }
        recognized = true;
    }

    if recognized {
        EngineLine::Info(info)
    } else {
        EngineLine::Unrecognized
    }
}

fn next_number<'a, T, I>(tokens: &mut I) -> Option<T>
where
    T: std::str::FromStr,
    I: Iterator<Item = &'a str>,
{
    tokens.next().and_then(|t| t.parse().ok())
}

// ABOUTME: Result normalizer - engine-native search output to the common result shape
//
// Pure functions, no I/O: the same SearchOutcome and position always yield the
// same result. Scores become signed centipawns plus an optional mate flag,
// whatever scale the engine reports in; principal variations become canonical
// UCI and SAN. A move that is not legal in the running position makes the
// whole output malformed, which the caller turns into a degraded result.

use cozy_chess::Board;
use thiserror::Error;
use tracing::warn;

use super::analysis::{
    AnalysisResult, AnalysisStatus, CandidateLine, Evaluation, RequestId, SearchStats, Wdl,
};
use super::descriptor::ScoreScale;
use super::grammar::{InfoLine, RawScore};
use super::position::{Position, parse_uci_move, san, uci_string};
use super::protocol::SearchOutcome;

/// Centipawn magnitude standing in for "mate in 0"
pub const MATE_SCORE: i32 = 10_000;

/// Converted centipawn scores are kept clear of the mate band
const MAX_CP: i32 = MATE_SCORE - 500;

/// lc0's Q → centipawn mapping: `90·tan(1.5637541897·q)`
const Q_TO_CP_SCALE: f64 = 90.0;
const Q_TO_CP_ANGLE: f64 = 1.563_754_189_7;

/// Output that cannot be mapped onto the common shape
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    /// Unparseable or illegal move, missing score, or out-of-range value
    #[error("Malformed engine output: {0}")]
    MalformedOutput(String),
}

/// Normalized form of one search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSearch {
    /// Ranked candidates
    pub candidates: Vec<CandidateLine>,
    /// Engine's chosen move, canonical UCI
    pub best_move: Option<String>,
    /// Engine's chosen move, SAN
    pub best_move_san: Option<String>,
    /// Evaluation of the top candidate
    pub evaluation: Option<Evaluation>,
    /// Search totals
    pub stats: SearchStats,
}

/// Normalize a whole search outcome against the position it was run on
pub fn normalize(
    outcome: &SearchOutcome,
    position: &Position,
    scale: ScoreScale,
) -> Result<NormalizedSearch, NormalizeError> {
    let board = position.board();

    let candidates = outcome
        .lines
        .iter()
        .enumerate()
        .map(|(index, line)| normalize_line(board, line, scale, index))
        .collect::<Result<Vec<_>, _>>()?;

    let (best_move, best_move_san) = match &outcome.best_move {
        Some(text) => {
            let mv = parse_uci_move(board, text)
                .map_err(|e| NormalizeError::MalformedOutput(format!("bestmove: {e}")))?;
            (Some(uci_string(board, mv)), Some(san(board, mv)))
        }
        None => (None, None),
    };

    let stats = SearchStats {
        nodes: outcome.stats.nodes,
        depth: outcome.stats.depth,
        seldepth: outcome.stats.seldepth,
        time_ms: outcome.stats.time_ms,
        nps: outcome.stats.nps,
    };

    Ok(NormalizedSearch {
        evaluation: candidates.first().map(|c| c.evaluation),
        candidates,
        best_move,
        best_move_san,
        stats,
    })
}

/// Normalize, or degrade to an engine-error result on malformed output
///
/// Malformed output from one engine must not fail a multi-engine request,
/// so the error is logged and folded into the result.
pub fn normalize_result(
    request_id: RequestId,
    engine: &str,
    outcome: &SearchOutcome,
    position: &Position,
    scale: ScoreScale,
) -> AnalysisResult {
    match normalize(outcome, position, scale) {
        Ok(normalized) => AnalysisResult {
            request_id,
            engine: engine.to_string(),
            status: AnalysisStatus::Completed,
            candidates: normalized.candidates,
            best_move: normalized.best_move,
            best_move_san: normalized.best_move_san,
            evaluation: normalized.evaluation,
            stats: normalized.stats,
            elapsed_ms: 0,
            error: None,
        },
        Err(e) => {
            warn!(engine = %engine, request_id = %request_id, error = %e, "Degrading result");
            AnalysisResult::engine_error(request_id, engine, e.to_string())
        }
    }
}

fn normalize_line(
    board: &Board,
    line: &InfoLine,
    scale: ScoreScale,
    index: usize,
) -> Result<CandidateLine, NormalizeError> {
    let score = line
        .score
        .ok_or_else(|| NormalizeError::MalformedOutput("candidate without score".to_string()))?;
    let (moves, san_moves) = normalize_pv(board, &line.pv)?;
    if moves.is_empty() {
        return Err(NormalizeError::MalformedOutput(
            "candidate without moves".to_string(),
        ));
    }

    Ok(CandidateLine {
        rank: u32::try_from(index + 1).unwrap_or(u32::MAX),
        moves,
        san: san_moves,
        evaluation: normalize_score(score, scale, line.wdl)?,
        depth: line.depth.unwrap_or(0),
        seldepth: line.seldepth,
        nodes: line.nodes.unwrap_or(0),
    })
}

/// Play a principal variation, returning it in canonical UCI and in SAN
pub fn normalize_pv(board: &Board, pv: &[String]) -> Result<(Vec<String>, Vec<String>), NormalizeError> {
    let mut board = board.clone();
    let mut uci = Vec::with_capacity(pv.len());
    let mut sans = Vec::with_capacity(pv.len());

    for (ply, text) in pv.iter().enumerate() {
        let mv = parse_uci_move(&board, text)
            .map_err(|e| NormalizeError::MalformedOutput(format!("pv ply {ply}: {e}")))?;
        uci.push(uci_string(&board, mv));
        sans.push(san(&board, mv));
        board.play_unchecked(mv);
    }

    Ok((uci, sans))
}

/// Map a native score onto signed centipawns plus optional mate distance
pub fn normalize_score(
    raw: RawScore,
    scale: ScoreScale,
    wdl: Option<[u32; 3]>,
) -> Result<Evaluation, NormalizeError> {
    let (cp, mate) = match raw {
        RawScore::Mate(n) if n > 0 => (MATE_SCORE - n.min(MATE_SCORE), Some(n)),
        RawScore::Mate(n) => (-(MATE_SCORE - n.saturating_abs().min(MATE_SCORE)), Some(n)),
        RawScore::Cp(value) => match scale {
            ScoreScale::Centipawns => (value.clamp(-MAX_CP, MAX_CP), None),
            ScoreScale::WinPercentage => (win_percentage_to_cp(value)?, None),
        },
    };

    // Engine-reported triples that are empty or overflow fall back to the estimate
    let wdl = match wdl {
        Some([win, draw, loss]) if reported_total(win, draw, loss).is_some_and(|t| t > 0) => {
            Wdl { win, draw, loss }
        }
        _ => estimate_wdl(cp),
    };

    Ok(Evaluation { cp, mate, wdl })
}

fn reported_total(win: u32, draw: u32, loss: u32) -> Option<u32> {
    win.checked_add(draw)?.checked_add(loss)
}

/// Win probability in hundredths of a percent to centipawns
fn win_percentage_to_cp(value: i32) -> Result<i32, NormalizeError> {
    if !(0..=10_000).contains(&value) {
        return Err(NormalizeError::MalformedOutput(format!(
            "win percentage {value} outside 0..=10000"
        )));
    }
    let p = f64::from(value) / 10_000.0;
    let q = 2.0f64.mul_add(p, -1.0);
    let cp = Q_TO_CP_SCALE * (Q_TO_CP_ANGLE * q).tan();
    // Bounded by the clamp; the cast cannot overflow
    #[allow(clippy::cast_possible_truncation)]
    let cp = cp.round().clamp(f64::from(-MAX_CP), f64::from(MAX_CP)) as i32;
    Ok(cp)
}

/// Logistic WDL estimate from centipawns, for engines that report no `wdl`
#[must_use]
pub fn estimate_wdl(cp: i32) -> Wdl {
    let pawns = f64::from(cp) / 100.0;
    let win_prob = 1.0 / (1.0 + (-pawns * 0.5).exp());
    let draw_prob = 0.3 * (-pawns.abs() * 0.3).exp();
    let total = 1.0 + draw_prob;

    // Both ratios lie in [0, 1]; truncation matches the per mille floor
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let (win, draw) = (
        ((win_prob / total) * 1000.0) as u32,
        ((draw_prob / total) * 1000.0) as u32,
    );
    Wdl {
        win,
        draw,
        loss: 1000u32.saturating_sub(win + draw),
    }
}

// ABOUTME: Position notation parsing, local legality validation and move notation
//
// Positions are validated with cozy-chess before any bytes reach an engine:
// some engines silently ignore a malformed `position` command and then search
// whatever board they had before. Accepted notations:
//
//   startpos
//   startpos moves e2e4 e7e5
//   fen <fen> [moves <uci>...]
//   <bare fen> [moves <uci>...]
//
// Also hosts the move notation helpers shared with the normalizer: UCI parsing
// that accepts both castling forms, canonical UCI rendering and SAN rendering.

use std::fmt;
use std::str::FromStr;

use cozy_chess::{Board, Color, File, GameStatus, Move, Piece, Square};
use thiserror::Error;

/// Errors produced while parsing or validating a position
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PositionError {
    /// Nothing to parse
    #[error("Position notation is empty")]
    Empty,

    /// FEN rejected by the board validator
    #[error("Invalid FEN '{fen}': {reason}")]
    InvalidFen {
        /// FEN as given
        fen: String,
        /// Validator message
        reason: String,
    },

    /// `moves` keyword without any moves, or stray tokens
    #[error("Malformed position notation: {0}")]
    Malformed(String),

    /// A listed move is not legal (or not parseable) in its position
    #[error("Illegal move '{mv}' at ply {ply}")]
    IllegalMove {
        /// Move as given
        mv: String,
        /// Zero-based index into the move list
        ply: usize,
    },
}

/// Errors produced while reading a single move in UCI notation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MoveNotationError {
    /// Not of the form `<from><to>[promotion]`
    #[error("Unparseable move '{0}'")]
    Syntax(String),

    /// Well-formed but not legal in the position
    #[error("Move '{0}' is not legal in this position")]
    Illegal(String),
}

/// A validated position: starting point plus the moves played from it
#[derive(Debug, Clone)]
pub struct Position {
    /// `None` means the standard starting position
    base_fen: Option<String>,

    /// Moves in canonical UCI notation
    moves: Vec<String>,

    /// Board after all moves were played
    board: Board,
}

impl Position {
    /// Standard starting position
    #[must_use]
    pub fn startpos() -> Self {
        Self {
            base_fen: None,
            moves: Vec::new(),
            board: Board::default(),
        }
    }

    /// Parse and validate a position notation
    pub fn parse(notation: &str) -> Result<Self, PositionError> {
        let tokens: Vec<&str> = notation.split_whitespace().collect();
        let Some((&first, rest)) = tokens.split_first() else {
            return Err(PositionError::Empty);
        };

        let (base_fen, after_base) = match first {
            "startpos" => (None, rest),
            "fen" => {
                let (fen, tail) = split_at_moves(rest);
                if fen.is_empty() {
                    return Err(PositionError::Malformed("'fen' without a FEN".to_string()));
                }
                (Some(fen), tail)
            }
            _ => {
                let (fen, tail) = split_at_moves(&tokens);
                (Some(fen), tail)
            }
        };

        let mut board = match &base_fen {
            None => Board::default(),
            Some(fields) => parse_fen(fields)?,
        };
        let base_fen = base_fen.map(|fields| complete_fen(&fields));

        let move_tokens = match after_base.split_first() {
            None => &[][..],
            Some((&"moves", moves)) if !moves.is_empty() => moves,
            Some((&"moves", _)) => {
                return Err(PositionError::Malformed("'moves' without any moves".to_string()));
            }
            Some((token, _)) => {
                return Err(PositionError::Malformed(format!("unexpected token '{token}'")));
            }
        };

        let mut moves = Vec::with_capacity(move_tokens.len());
        for (ply, token) in move_tokens.iter().enumerate() {
            let mv = parse_uci_move(&board, token).map_err(|_| PositionError::IllegalMove {
                mv: (*token).to_string(),
                ply,
            })?;
            moves.push(uci_string(&board, mv));
            board.play_unchecked(mv);
        }

        Ok(Self {
            base_fen,
            moves,
            board,
        })
    }

    /// Whether this position extends `earlier` within the same game: same
    /// starting point, with `earlier`'s moves as a prefix
    #[must_use]
    pub fn continues(&self, earlier: &Self) -> bool {
        self.base_fen == earlier.base_fen && self.moves.starts_with(&earlier.moves)
    }

    /// The `position ...` command for this position
    #[must_use]
    pub fn uci_command(&self) -> String {
        let mut command = match &self.base_fen {
            None => "position startpos".to_string(),
            Some(fen) => format!("position fen {fen}"),
        };
        if !self.moves.is_empty() {
            command.push_str(" moves ");
            command.push_str(&self.moves.join(" "));
        }
        command
    }

    /// Board after all listed moves
    #[must_use]
    pub const fn board(&self) -> &Board {
        &self.board
    }

    /// FEN of the final board
    #[must_use]
    pub fn fen(&self) -> String {
        self.board.to_string()
    }

    /// Moves played from the base position, canonical UCI
    #[must_use]
    pub fn moves(&self) -> &[String] {
        &self.moves
    }

    /// Whether the side to move has no legal moves
    #[must_use]
    pub fn is_game_over(&self) -> bool {
        self.board.status() != GameStatus::Ongoing
    }
}

impl FromStr for Position {
    type Err = PositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Strip the leading "position " so the notation parses back
        let command = self.uci_command();
        f.write_str(command.trim_start_matches("position "))
    }
}

fn split_at_moves<'t>(tokens: &'t [&'t str]) -> (String, &'t [&'t str]) {
    let end = tokens.iter().position(|t| *t == "moves").unwrap_or(tokens.len());
    (tokens[..end].join(" "), &tokens[end..])
}

/// Fill in missing halfmove/fullmove counters (`- 0 1`) for short FENs
fn complete_fen(fen: &str) -> String {
    let fields = fen.split_whitespace().count();
    match fields {
        4 => format!("{fen} 0 1"),
        5 => format!("{fen} 1"),
        _ => fen.to_string(),
    }
}

fn parse_fen(fen: &str) -> Result<Board, PositionError> {
    let fields = fen.split_whitespace().count();
    if !(4..=6).contains(&fields) {
        return Err(PositionError::InvalidFen {
            fen: fen.to_string(),
            reason: format!("expected 4 to 6 fields, found {fields}"),
        });
    }
    Board::from_fen(&complete_fen(fen), false).map_err(|e| PositionError::InvalidFen {
        fen: fen.to_string(),
        reason: format!("{e:?}"),
    })
}

// ==================== Move notation ====================

/// Parse a UCI move, accepting castling as either king-two-squares (`e1g1`)
/// or king-takes-rook (`e1h1`), and check legality
pub fn parse_uci_move(board: &Board, text: &str) -> Result<Move, MoveNotationError> {
    let mv: Move = text
        .parse()
        .map_err(|_| MoveNotationError::Syntax(text.to_string()))?;
    let mv = king_takes_rook(board, mv);
    if board.is_legal(mv) {
        Ok(mv)
    } else {
        Err(MoveNotationError::Illegal(text.to_string()))
    }
}

/// Canonical UCI: castling rendered as the king moving two squares
#[must_use]
pub fn uci_string(board: &Board, mv: Move) -> String {
    if is_castling(board, mv) {
        let file = if file_index(mv.to) > file_index(mv.from) {
            File::G
        } else {
            File::C
        };
        format!("{}{}", mv.from, Square::new(file, mv.from.rank()))
    } else {
        mv.to_string()
    }
}

/// Standard algebraic notation for a legal move
#[must_use]
pub fn san(board: &Board, mv: Move) -> String {
    let mut text = String::new();

    if is_castling(board, mv) {
        text.push_str(if file_index(mv.to) > file_index(mv.from) {
            "O-O"
        } else {
            "O-O-O"
        });
    } else {
        let piece = board.piece_on(mv.from).unwrap_or(Piece::Pawn);
        let mover = board.side_to_move();
        let is_capture = board.colors(!mover).has(mv.to)
            || (piece == Piece::Pawn && mv.from.file() != mv.to.file());

        if piece == Piece::Pawn {
            if is_capture {
                text.push(file_char(mv.from));
            }
        } else {
            text.push(piece_letter(piece));
            text.push_str(&disambiguation(board, piece, mv));
        }
        if is_capture {
            text.push('x');
        }
        text.push_str(&mv.to.to_string());
        if let Some(promotion) = mv.promotion {
            text.push('=');
            text.push(piece_letter(promotion));
        }
    }

    let mut after = board.clone();
    after.play_unchecked(mv);
    if !after.checkers().is_empty() {
        text.push(if after.status() == GameStatus::Won { '#' } else { '+' });
    }
    text
}

fn king_takes_rook(board: &Board, mv: Move) -> Move {
    let mover = board.side_to_move();
    if board.piece_on(mv.from) != Some(Piece::King)
        || board.color_on(mv.from) != Some(mover)
        || mv.promotion.is_some()
        || mv.from.rank() != mv.to.rank()
    {
        return mv;
    }

    let rights = board.castle_rights(mover);
    let rook_file = match file_index(mv.to) - file_index(mv.from) {
        2 => rights.short,
        -2 => rights.long,
        _ => None,
    };
    match rook_file {
        Some(file) => Move {
            from: mv.from,
            to: Square::new(file, mv.from.rank()),
            promotion: None,
        },
        None => mv,
    }
}

fn is_castling(board: &Board, mv: Move) -> bool {
    board.piece_on(mv.from) == Some(Piece::King)
        && board.color_on(mv.from).is_some()
        && board.color_on(mv.to) == board.color_on(mv.from)
}

/// File/rank prefix needed to tell apart same-type pieces reaching one square
fn disambiguation(board: &Board, piece: Piece, mv: Move) -> String {
    let mut rivals: Vec<Square> = Vec::new();
    board.generate_moves(|moves| {
        if moves.piece == piece {
            for candidate in moves {
                if candidate.to == mv.to && candidate.from != mv.from && !rivals.contains(&candidate.from) {
                    rivals.push(candidate.from);
                }
            }
        }
        false
    });

    if rivals.is_empty() {
        return String::new();
    }
    let shares_file = rivals.iter().any(|sq| sq.file() == mv.from.file());
    let shares_rank = rivals.iter().any(|sq| sq.rank() == mv.from.rank());
    if !shares_file {
        file_char(mv.from).to_string()
    } else if !shares_rank {
        rank_char(mv.from).to_string()
    } else {
        mv.from.to_string()
    }
}

const fn piece_letter(piece: Piece) -> char {
    match piece {
        Piece::Pawn => 'P',
        Piece::Knight => 'N',
        Piece::Bishop => 'B',
        Piece::Rook => 'R',
        Piece::Queen => 'Q',
        Piece::King => 'K',
    }
}

fn file_index(square: Square) -> i8 {
    square.file() as i8
}

fn file_char(square: Square) -> char {
    char::from(b'a' + square.file() as u8)
}

fn rank_char(square: Square) -> char {
    char::from(b'1' + square.rank() as u8)
}

/// Side to move as a sign: +1 for white, -1 for black
#[must_use]
pub fn side_sign(board: &Board) -> i32 {
    match board.side_to_move() {
        Color::White => 1,
        Color::Black => -1,
    }
}

use super::{Color, Piece, PieceKind, SfenError, Square};

/// Standard starting position (hirate).
pub const STARTPOS_SFEN: &str =
    "lnsgkgsnl/1r5b1/ppppppppp/9/9/9/PPPPPPPPP/1B5R1/LNSGKGSNL b - 1";

/// Hand emission order per SFEN convention: rook first, pawn last.
const HAND_ORDER: [PieceKind; 7] = [
    PieceKind::Rook,
    PieceKind::Bishop,
    PieceKind::Gold,
    PieceKind::Silver,
    PieceKind::Knight,
    PieceKind::Lance,
    PieceKind::Pawn,
];

/// A full shogi position: board, side to move, hands, move counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    board: [Option<Piece>; 81],
    side: Color,
    /// Hand counts indexed `[color][PieceKind::hand_index]`.
    hands: [[u8; 7]; 2],
    ply: u32,
}

/// Apply one trusted-legal USI move to an SFEN string and return the
/// resulting SFEN. This is the tree engine's cache-derivation primitive.
pub fn apply_move_sfen(sfen: &str, usi: &str) -> Result<String, SfenError> {
    let mut pos = Position::from_sfen(sfen)?;
    pos.apply_usi(usi)?;
    Ok(pos.to_sfen())
}

impl Position {
    pub fn startpos() -> Position {
        // STARTPOS_SFEN is a constant; parsing it cannot fail.
        Position::from_sfen(STARTPOS_SFEN).unwrap_or_else(|_| unreachable!())
    }

    pub fn side_to_move(&self) -> Color {
        self.side
    }

    pub fn ply(&self) -> u32 {
        self.ply
    }

    pub fn piece_at(&self, sq: Square) -> Option<Piece> {
        self.board[sq.index()]
    }

    pub fn hand_count(&self, color: Color, kind: PieceKind) -> u8 {
        match kind.hand_index() {
            Some(i) => self.hands[color as usize][i],
            None => 0,
        }
    }

    pub fn from_sfen(sfen: &str) -> Result<Position, SfenError> {
        let mut fields = sfen.split_whitespace();
        let board_field = fields
            .next()
            .ok_or_else(|| SfenError::Malformed("empty sfen".into()))?;
        let side_field = fields
            .next()
            .ok_or_else(|| SfenError::Malformed("missing side to move".into()))?;
        let hand_field = fields
            .next()
            .ok_or_else(|| SfenError::Malformed("missing hands".into()))?;
        let ply = match fields.next() {
            Some(n) => n
                .parse::<u32>()
                .map_err(|_| SfenError::Malformed(format!("bad move counter '{n}'")))?,
            None => 1,
        };

        let board = Self::parse_board(board_field)?;
        let side = match side_field {
            "b" => Color::Black,
            "w" => Color::White,
            other => return Err(SfenError::Malformed(format!("bad side '{other}'"))),
        };
        let hands = Self::parse_hands(hand_field)?;

        Ok(Position {
            board,
            side,
            hands,
            ply,
        })
    }

    fn parse_board(field: &str) -> Result<[Option<Piece>; 81], SfenError> {
        let mut board = [None; 81];
        let ranks: Vec<&str> = field.split('/').collect();
        if ranks.len() != 9 {
            return Err(SfenError::Malformed(format!(
                "expected 9 ranks, got {}",
                ranks.len()
            )));
        }
        for (rank_idx, rank) in ranks.iter().enumerate() {
            let mut col = 0usize;
            let mut promoted = false;
            for c in rank.chars() {
                if let Some(d) = c.to_digit(10) {
                    if promoted {
                        return Err(SfenError::Malformed(format!(
                            "dangling '+' in rank {}",
                            rank_idx + 1
                        )));
                    }
                    col += d as usize;
                } else if c == '+' {
                    promoted = true;
                } else {
                    let base = PieceKind::from_letter(c).ok_or_else(|| {
                        SfenError::Malformed(format!("unknown piece letter '{c}'"))
                    })?;
                    let kind = if promoted {
                        base.promote().ok_or_else(|| {
                            SfenError::Malformed(format!("'+{c}' is not promotable"))
                        })?
                    } else {
                        base
                    };
                    let color = if c.is_ascii_uppercase() {
                        Color::Black
                    } else {
                        Color::White
                    };
                    if col >= 9 {
                        return Err(SfenError::Malformed(format!(
                            "rank {} overflows 9 files",
                            rank_idx + 1
                        )));
                    }
                    board[rank_idx * 9 + col] = Some(Piece { color, kind });
                    col += 1;
                    promoted = false;
                }
            }
            if col != 9 {
                return Err(SfenError::Malformed(format!(
                    "rank {} covers {} files",
                    rank_idx + 1,
                    col
                )));
            }
        }
        Ok(board)
    }

    fn parse_hands(field: &str) -> Result<[[u8; 7]; 2], SfenError> {
        let mut hands = [[0u8; 7]; 2];
        if field == "-" {
            return Ok(hands);
        }
        let mut count = 0u32;
        for c in field.chars() {
            if let Some(d) = c.to_digit(10) {
                count = count * 10 + d;
            } else {
                let kind = PieceKind::from_letter(c)
                    .ok_or_else(|| SfenError::Malformed(format!("bad hand piece '{c}'")))?;
                let idx = kind
                    .hand_index()
                    .ok_or_else(|| SfenError::Malformed(format!("'{c}' cannot be in hand")))?;
                let color = if c.is_ascii_uppercase() {
                    Color::Black
                } else {
                    Color::White
                };
                let n = if count == 0 { 1 } else { count };
                if n > 18 {
                    return Err(SfenError::Malformed(format!("hand count {n} too large")));
                }
                hands[color as usize][idx] += n as u8;
                count = 0;
            }
        }
        if count != 0 {
            return Err(SfenError::Malformed("dangling hand count".into()));
        }
        Ok(hands)
    }

    pub fn to_sfen(&self) -> String {
        let mut out = String::with_capacity(96);
        for rank_idx in 0..9 {
            if rank_idx > 0 {
                out.push('/');
            }
            let mut empty = 0;
            for col in 0..9 {
                match self.board[rank_idx * 9 + col] {
                    Some(piece) => {
                        if empty > 0 {
                            out.push(char::from_digit(empty, 10).unwrap_or('0'));
                            empty = 0;
                        }
                        if piece.kind.is_promoted() {
                            out.push('+');
                        }
                        let letter = piece.kind.letter();
                        out.push(match piece.color {
                            Color::Black => letter,
                            Color::White => letter.to_ascii_lowercase(),
                        });
                    }
                    None => empty += 1,
                }
            }
            if empty > 0 {
                out.push(char::from_digit(empty, 10).unwrap_or('0'));
            }
        }

        out.push(' ');
        out.push(match self.side {
            Color::Black => 'b',
            Color::White => 'w',
        });

        out.push(' ');
        let mut any_hand = false;
        for color in [Color::Black, Color::White] {
            for kind in HAND_ORDER {
                let idx = kind.hand_index().unwrap_or(0);
                let n = self.hands[color as usize][idx];
                if n == 0 {
                    continue;
                }
                any_hand = true;
                if n > 1 {
                    out.push_str(&n.to_string());
                }
                let letter = kind.letter();
                out.push(match color {
                    Color::Black => letter,
                    Color::White => letter.to_ascii_lowercase(),
                });
            }
        }
        if !any_hand {
            out.push('-');
        }

        out.push(' ');
        out.push_str(&self.ply.to_string());
        out
    }

    /// Apply one USI move. Board moves `7g7f`, promotions `2b3a+`, drops
    /// `P*5f`. Only structural sanity is checked.
    pub fn apply_usi(&mut self, usi: &str) -> Result<(), SfenError> {
        let mv = usi.trim();
        let invalid = |reason: &str| SfenError::InvalidMove {
            mv: mv.to_string(),
            reason: reason.to_string(),
        };

        let chars: Vec<char> = mv.chars().collect();
        if chars.len() == 4 && chars[1] == '*' {
            // Drop move.
            let kind = PieceKind::from_letter(chars[0]).ok_or_else(|| invalid("bad drop piece"))?;
            let idx = kind
                .hand_index()
                .ok_or_else(|| invalid("piece cannot be dropped"))?;
            if kind.is_promoted() || kind == PieceKind::King {
                return Err(invalid("piece cannot be dropped"));
            }
            let to =
                Square::parse_usi(chars[2], chars[3]).ok_or_else(|| invalid("bad drop square"))?;
            if self.board[to.index()].is_some() {
                return Err(invalid("drop square occupied"));
            }
            if self.hands[self.side as usize][idx] == 0 {
                return Err(invalid("piece not in hand"));
            }
            self.hands[self.side as usize][idx] -= 1;
            self.board[to.index()] = Some(Piece {
                color: self.side,
                kind,
            });
        } else if chars.len() == 4 || (chars.len() == 5 && chars[4] == '+') {
            let from =
                Square::parse_usi(chars[0], chars[1]).ok_or_else(|| invalid("bad source square"))?;
            let to = Square::parse_usi(chars[2], chars[3])
                .ok_or_else(|| invalid("bad destination square"))?;
            let promote = chars.len() == 5;

            let piece = self.board[from.index()].ok_or_else(|| invalid("source square empty"))?;
            if piece.color != self.side {
                return Err(invalid("source piece belongs to opponent"));
            }
            if let Some(target) = self.board[to.index()] {
                if target.color == self.side {
                    return Err(invalid("destination occupied by own piece"));
                }
                let idx = target
                    .kind
                    .hand_index()
                    .ok_or_else(|| invalid("cannot capture king"))?;
                self.hands[self.side as usize][idx] += 1;
            }
            let kind = if promote {
                piece.kind.promote().ok_or_else(|| invalid("piece cannot promote"))?
            } else {
                piece.kind
            };
            self.board[from.index()] = None;
            self.board[to.index()] = Some(Piece {
                color: piece.color,
                kind,
            });
        } else {
            return Err(invalid("unrecognized move syntax"));
        }

        self.side = self.side.flip();
        self.ply += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startpos_round_trips() {
        let pos = Position::from_sfen(STARTPOS_SFEN).unwrap();
        assert_eq!(pos.to_sfen(), STARTPOS_SFEN);
        assert_eq!(pos.side_to_move(), Color::Black);
        assert_eq!(pos.ply(), 1);
    }

    #[test]
    fn pawn_push_from_startpos() {
        let next = apply_move_sfen(STARTPOS_SFEN, "7g7f").unwrap();
        assert_eq!(
            next,
            "lnsgkgsnl/1r5b1/ppppppppp/9/9/2P6/PP1PPPPPP/1B5R1/LNSGKGSNL w - 2"
        );
    }

    #[test]
    fn capture_moves_piece_into_hand() {
        // Black bishop takes the white bishop on 2b after the classic
        // 7g7f 3c3d 8h2b+ opening of the bishop exchange.
        let s1 = apply_move_sfen(STARTPOS_SFEN, "7g7f").unwrap();
        let s2 = apply_move_sfen(&s1, "3c3d").unwrap();
        let s3 = apply_move_sfen(&s2, "8h2b+").unwrap();
        let pos = Position::from_sfen(&s3).unwrap();
        assert_eq!(pos.hand_count(Color::Black, PieceKind::Bishop), 1);
        let sq = Square::new(2, 2).unwrap();
        assert_eq!(
            pos.piece_at(sq),
            Some(Piece {
                color: Color::Black,
                kind: PieceKind::Horse
            })
        );
        assert_eq!(pos.side_to_move(), Color::White);
        assert_eq!(pos.ply(), 4);
    }

    #[test]
    fn drop_consumes_hand_piece() {
        let sfen = "lnsgkgsnl/1r5b1/ppppppppp/9/9/9/PPPPPPPPP/1B5R1/LNSGKGSNL b P 1";
        let next = apply_move_sfen(sfen, "P*5e").unwrap();
        let pos = Position::from_sfen(&next).unwrap();
        assert_eq!(pos.hand_count(Color::Black, PieceKind::Pawn), 0);
        assert_eq!(
            pos.piece_at(Square::new(5, 5).unwrap()),
            Some(Piece {
                color: Color::Black,
                kind: PieceKind::Pawn
            })
        );
    }

    #[test]
    fn drop_without_hand_piece_is_invalid() {
        let err = apply_move_sfen(STARTPOS_SFEN, "P*5e").unwrap_err();
        assert!(matches!(err, SfenError::InvalidMove { .. }));
    }

    #[test]
    fn moving_from_empty_square_is_invalid() {
        let err = apply_move_sfen(STARTPOS_SFEN, "5e5d").unwrap_err();
        assert!(matches!(err, SfenError::InvalidMove { .. }));
    }

    #[test]
    fn moving_opponent_piece_is_invalid() {
        let err = apply_move_sfen(STARTPOS_SFEN, "3c3d").unwrap_err();
        assert!(matches!(err, SfenError::InvalidMove { .. }));
    }

    #[test]
    fn gold_cannot_promote() {
        let sfen = "9/9/4G4/9/9/9/9/9/9 b - 1";
        let err = apply_move_sfen(sfen, "5c5b+").unwrap_err();
        assert!(matches!(err, SfenError::InvalidMove { .. }));
    }

    #[test]
    fn hand_counts_emit_with_multipliers() {
        let sfen = "9/9/9/9/9/9/9/9/9 b 2P3pb 1";
        let pos = Position::from_sfen(sfen).unwrap();
        assert_eq!(pos.hand_count(Color::Black, PieceKind::Pawn), 2);
        assert_eq!(pos.hand_count(Color::White, PieceKind::Pawn), 3);
        assert_eq!(pos.hand_count(Color::White, PieceKind::Bishop), 1);
        assert_eq!(pos.to_sfen(), "9/9/9/9/9/9/9/9/9 b 2Pb3p 1");
    }

    #[test]
    fn malformed_sfens_are_rejected() {
        assert!(Position::from_sfen("").is_err());
        assert!(Position::from_sfen("lnsgkgsnl/1r5b1 b - 1").is_err());
        assert!(Position::from_sfen(
            "lnsgkgsnl/1r5b1/ppppppppp/9/9/9/PPPPPPPPP/1B5R1/LNSGKGSNL x - 1"
        )
        .is_err());
        assert!(Position::from_sfen(
            "lnsgkgsnlx/1r5b1/ppppppppp/9/9/9/PPPPPPPPP/1B5R1/LNSGKGSNL b - 1"
        )
        .is_err());
    }
}

//! USI text codec.
//!
//! Parsing accepts one `position …` command per non-empty line and merges
//! them into a tree; shared move prefixes collapse through `play_move`
//! dedup, so importing an `all_variations` export reconstructs the original
//! topology. A plain single-command text yields a single-line game.

use log::debug;

use crate::shogi::STARTPOS_SFEN;
use crate::tree::GameTree;

use super::{CodecError, EmitOptions, Format, FormatCodec, ParsedGame};

pub struct UsiCodec;

fn malformed(line: usize, column: usize, detail: impl Into<String>) -> CodecError {
    CodecError::Malformed {
        line,
        column,
        detail: detail.into(),
    }
}

/// One parsed `position` command: the base SFEN and the move chain.
fn parse_position_line(line: &str, line_no: usize) -> Result<(String, Vec<String>), CodecError> {
    let column_of = |token: &str| line.find(token).unwrap_or(0);
    let mut tokens = line.split_whitespace().peekable();

    match tokens.next() {
        Some("position") => {}
        Some(other) => {
            return Err(malformed(
                line_no,
                column_of(other),
                format!("expected 'position', found '{other}'"),
            ))
        }
        None => return Err(malformed(line_no, 0, "empty position command")),
    }

    let sfen = match tokens.next() {
        Some("startpos") => STARTPOS_SFEN.to_string(),
        Some("sfen") => {
            let mut parts = Vec::new();
            while let Some(&token) = tokens.peek() {
                if token == "moves" {
                    break;
                }
                parts.push(token);
                tokens.next();
            }
            if parts.is_empty() {
                return Err(malformed(line_no, line.len(), "missing sfen fields"));
            }
            parts.join(" ")
        }
        Some(other) => {
            return Err(malformed(
                line_no,
                column_of(other),
                format!("expected 'startpos' or 'sfen', found '{other}'"),
            ))
        }
        None => return Err(malformed(line_no, line.len(), "truncated position command")),
    };

    let moves = match tokens.next() {
        Some("moves") => tokens.map(str::to_string).collect(),
        Some(other) => {
            return Err(malformed(
                line_no,
                column_of(other),
                format!("expected 'moves', found '{other}'"),
            ))
        }
        None => Vec::new(),
    };

    Ok((sfen, moves))
}

impl FormatCodec for UsiCodec {
    fn format(&self) -> Format {
        Format::Usi
    }

    fn parse(&self, text: &str) -> Result<ParsedGame, CodecError> {
        // First pass: syntax. Every non-empty line must be a position
        // command, and all lines must share one base SFEN.
        let mut commands = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let line_no = index + 1;
            let (sfen, moves) = parse_position_line(line, line_no)?;
            if let Some((_, first_sfen, _)) = commands.first() {
                if *first_sfen != sfen {
                    return Err(malformed(
                        line_no,
                        0,
                        "position lines disagree on the base sfen",
                    ));
                }
            }
            commands.push((line_no, sfen, moves));
        }

        let (first_line, base_sfen, _) = commands
            .first()
            .ok_or_else(|| malformed(1, 0, "no position command found"))?;
        let mut tree = GameTree::create("Imported kifu", base_sfen)
            .map_err(|e| malformed(*first_line, 0, e.to_string()))?;

        // Second pass: replay each line from the root; dedup merges the
        // shared prefixes.
        let mut warnings = Vec::new();
        let parsed_lines = commands.len();
        for (line_no, _, moves) in &commands {
            let mut cursor = tree.game().root_node_id.clone();
            for (move_index, mv) in moves.iter().enumerate() {
                let (node_id, _created) = tree.play_move(&cursor, mv).map_err(|e| {
                    malformed(
                        *line_no,
                        0,
                        format!("move {} ('{}'): {}", move_index + 1, mv, e),
                    )
                })?;
                cursor = node_id;
            }
        }
        if parsed_lines > 1 {
            warnings.push(format!("merged {parsed_lines} position lines into one tree"));
        }
        // Imports land on the starting position.
        let root = tree.game().root_node_id.clone();
        tree.jump(&root)
            .unwrap_or_else(|_| unreachable!("root always resolves"));
        debug!("usi parse: {} lines merged", parsed_lines);
        Ok(ParsedGame { tree, warnings })
    }

    fn emit(&self, tree: &GameTree, options: EmitOptions) -> Result<String, CodecError> {
        if options.all_variations {
            let mut out = String::new();
            for path in leaf_paths(tree) {
                out.push_str(&position_line(tree, &path));
                out.push('\n');
            }
            Ok(out)
        } else {
            Ok(format!("{}\n", position_line(tree, &main_line(tree))))
        }
    }
}

/// Moves along the chain of first children from the root.
fn main_line(tree: &GameTree) -> Vec<String> {
    let mut moves = Vec::new();
    let mut cursor = tree.game().root_node_id.clone();
    while let Ok(Some(child)) = tree.first_child_of(&cursor) {
        if let Some(mv) = &child.move_usi {
            moves.push(mv.clone());
        }
        cursor = child.id.clone();
    }
    moves
}

/// Every root-to-leaf move sequence, depth-first in first-child order.
fn leaf_paths(tree: &GameTree) -> Vec<Vec<String>> {
    let mut paths = Vec::new();
    let mut stack = vec![(tree.game().root_node_id.clone(), Vec::new())];
    while let Some((node_id, moves)) = stack.pop() {
        let children = tree.children_of(&node_id).unwrap_or(&[]);
        if children.is_empty() {
            paths.push(moves);
            continue;
        }
        // Reverse push keeps first-child order on the stack pop.
        for child_id in children.iter().rev() {
            if let Ok(child) = tree.node(child_id) {
                let mut extended = moves.clone();
                if let Some(mv) = &child.move_usi {
                    extended.push(mv.clone());
                }
                stack.push((child_id.clone(), extended));
            }
        }
    }
    paths
}

fn position_line(tree: &GameTree, moves: &[String]) -> String {
    if moves.is_empty() {
        format!("position sfen {}", tree.game().initial_sfen)
    } else {
        format!(
            "position sfen {} moves {}",
            tree.game().initial_sfen,
            moves.join(" ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecRegistry, EmitOptions};

    #[test]
    fn parses_single_position_line() {
        let text = format!("position sfen {STARTPOS_SFEN} moves 7g7f 3c3d 2g2f\n");
        let parsed = UsiCodec.parse(&text).unwrap();
        assert!(parsed.warnings.is_empty());
        let tree = parsed.tree;
        let root = tree.game().root_node_id.clone();
        // Single line: every node has at most one child.
        let mut cursor = root.clone();
        let mut depth = 0;
        while let Ok(Some(child)) = tree.first_child_of(&cursor) {
            assert_eq!(tree.children_of(&cursor).unwrap().len(), 1);
            cursor = child.id.clone();
            depth += 1;
        }
        assert_eq!(depth, 3);
        assert_eq!(tree.game().current_node_id, root);
    }

    #[test]
    fn parses_startpos_shorthand() {
        let parsed = UsiCodec.parse("position startpos moves 7g7f\n").unwrap();
        assert_eq!(parsed.tree.game().initial_sfen, STARTPOS_SFEN);
    }

    #[test]
    fn merges_variation_lines_into_a_tree() {
        let text = format!(
            "position sfen {STARTPOS_SFEN} moves 7g7f 3c3d\n\
             position sfen {STARTPOS_SFEN} moves 7g7f 8c8d\n\
             position sfen {STARTPOS_SFEN} moves 2g2f\n"
        );
        let parsed = UsiCodec.parse(&text).unwrap();
        assert_eq!(parsed.warnings.len(), 1);
        let tree = parsed.tree;
        let root = tree.game().root_node_id.clone();
        let top = tree.children_of(&root).unwrap().to_vec();
        assert_eq!(top.len(), 2);
        // 7g7f gained two replies.
        assert_eq!(tree.children_of(&top[0]).unwrap().len(), 2);
    }

    #[test]
    fn malformed_input_reports_line_numbers() {
        let err = UsiCodec.parse("position nonsense\n").unwrap_err();
        match err {
            CodecError::Malformed { line, detail, .. } => {
                assert_eq!(line, 1);
                assert!(detail.contains("startpos"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let text = format!(
            "position sfen {STARTPOS_SFEN} moves 7g7f\nposition startpos moves 9z9z\n"
        );
        let err = UsiCodec.parse(&text).unwrap_err();
        match err {
            CodecError::Malformed { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(UsiCodec.parse("\n\n").is_err());
    }

    #[test]
    fn mismatched_base_sfens_are_rejected() {
        let text = format!(
            "position sfen {STARTPOS_SFEN} moves 7g7f\n\
             position sfen lnsgkgsnl/1r5b1/ppppppppp/9/9/9/PPPPPPPPP/1B5R1/LNSGKGSNL w - 2\n"
        );
        assert!(UsiCodec.parse(&text).is_err());
    }

    #[test]
    fn emits_main_line_by_default() {
        let mut tree = GameTree::create("t", STARTPOS_SFEN).unwrap();
        let root = tree.game().root_node_id.clone();
        let (a, _) = tree.play_move(&root, "7g7f").unwrap();
        tree.play_move(&a, "3c3d").unwrap();
        tree.jump(&root).unwrap();
        tree.play_move(&root, "2g2f").unwrap();

        let text = UsiCodec.emit(&tree, EmitOptions::default()).unwrap();
        assert_eq!(
            text,
            format!("position sfen {STARTPOS_SFEN} moves 7g7f 3c3d\n")
        );
    }

    #[test]
    fn emits_one_line_per_leaf_with_all_variations() {
        let mut tree = GameTree::create("t", STARTPOS_SFEN).unwrap();
        let root = tree.game().root_node_id.clone();
        let (a, _) = tree.play_move(&root, "7g7f").unwrap();
        tree.play_move(&a, "3c3d").unwrap();
        tree.jump(&a).unwrap();
        tree.play_move(&a, "8c8d").unwrap();
        tree.jump(&root).unwrap();
        tree.play_move(&root, "2g2f").unwrap();

        let text = UsiCodec
            .emit(
                &tree,
                EmitOptions {
                    all_variations: true,
                },
            )
            .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                format!("position sfen {STARTPOS_SFEN} moves 7g7f 3c3d"),
                format!("position sfen {STARTPOS_SFEN} moves 7g7f 8c8d"),
                format!("position sfen {STARTPOS_SFEN} moves 2g2f"),
            ]
        );
    }

    #[test]
    fn all_variations_round_trips_topology() {
        let mut tree = GameTree::create("t", STARTPOS_SFEN).unwrap();
        let root = tree.game().root_node_id.clone();
        let (a, _) = tree.play_move(&root, "7g7f").unwrap();
        tree.play_move(&a, "3c3d").unwrap();
        tree.jump(&a).unwrap();
        tree.play_move(&a, "8c8d").unwrap();

        let registry = CodecRegistry::with_builtin();
        let options = EmitOptions {
            all_variations: true,
        };
        let text = registry.emit(Format::Usi, &tree, options).unwrap();
        let reparsed = registry.parse(Format::Usi, &text).unwrap().tree;
        let text2 = registry.emit(Format::Usi, &reparsed, options).unwrap();
        assert_eq!(text, text2);
    }
}

//! USI line parsing and principal-variation consolidation.
//!
//! The stdout reader task classifies every engine line with
//! [`parse_engine_line`]; the coordinator folds `info` lines into a
//! [`PvCollector`], which holds the latest consolidated line per `multipv`
//! index.

use std::collections::BTreeMap;

use log::trace;

use super::types::{InfoLine, PvLine, ScoreType};

/// Classified engine output line.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineLine {
    UsiOk,
    ReadyOk,
    /// `id name <engine name>`
    IdName(String),
    /// `option name <name> type ...` — only the name is retained.
    OptionDecl(String),
    Info(InfoLine),
    /// `bestmove <move> [ponder <move>]` — only the move is retained.
    BestMove(String),
    Other,
}

/// Classify one line of engine stdout.
pub fn parse_engine_line(line: &str) -> EngineLine {
    let trimmed = line.trim();
    let mut tokens = trimmed.split_whitespace();
    match tokens.next() {
        Some("usiok") => EngineLine::UsiOk,
        Some("readyok") => EngineLine::ReadyOk,
        Some("id") => match tokens.next() {
            Some("name") => EngineLine::IdName(tokens.collect::<Vec<_>>().join(" ")),
            _ => EngineLine::Other,
        },
        Some("option") => match parse_option_name(trimmed) {
            Some(name) => EngineLine::OptionDecl(name),
            None => EngineLine::Other,
        },
        Some("info") => EngineLine::Info(parse_info_tokens(tokens)),
        Some("bestmove") => match tokens.next() {
            Some(mv) => EngineLine::BestMove(mv.to_string()),
            None => EngineLine::Other,
        },
        _ => EngineLine::Other,
    }
}

/// Extract the option name from an `option name <name> type ...`
/// declaration. Option names may contain spaces (`Skill Level`).
fn parse_option_name(line: &str) -> Option<String> {
    let rest = line.strip_prefix("option")?.trim_start();
    let rest = rest.strip_prefix("name")?.trim_start();
    let name = match rest.find(" type ") {
        Some(at) => &rest[..at],
        None => rest,
    };
    let name = name.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Parse the attribute tokens of an `info` line. Unknown tokens are
/// skipped; `pv` consumes the remainder; `string` discards it.
fn parse_info_tokens<'a, I>(mut tokens: I) -> InfoLine
where
    I: Iterator<Item = &'a str>,
{
    let mut info = InfoLine::default();
    while let Some(token) = tokens.next() {
        match token {
            "depth" => info.depth = next_number(&mut tokens),
            "seldepth" => info.seldepth = next_number(&mut tokens),
            "multipv" => info.multipv = next_number(&mut tokens),
            "nodes" => info.nodes = next_number(&mut tokens),
            "nps" => info.nps = next_number(&mut tokens),
            "hashfull" => info.hashfull = next_number(&mut tokens),
            "time" | "currmovenumber" | "currmove" => {
                tokens.next();
            }
            "score" => match tokens.next() {
                Some("cp") => {
                    if let Some(v) = next_number::<i32, _>(&mut tokens) {
                        info.score = Some((ScoreType::Cp, v));
                    }
                }
                Some("mate") => {
                    if let Some(v) = next_number::<i32, _>(&mut tokens) {
                        info.score = Some((ScoreType::Mate, v));
                    }
                }
                other => {
                    trace!("unrecognized score kind: {:?}", other);
                }
            },
            "pv" => {
                info.pv = Some(tokens.map(str::to_string).collect());
                break;
            }
            "string" => break,
            other => {
                trace!("skipping info token: {}", other);
            }
        }
    }
    info
}

fn next_number<'a, T, I>(tokens: &mut I) -> Option<T>
where
    T: std::str::FromStr,
    I: Iterator<Item = &'a str>,
{
    tokens.next().and_then(|t| t.parse().ok())
}

/// Latest consolidated [`PvLine`] per `multipv` index.
///
/// `apply` merges one `info` line: counters update in place, and only a
/// line carrying `pv` replaces the stored variation. The coordinator
/// consults the returned change flag for its dirty bit.
#[derive(Debug, Default)]
pub struct PvCollector {
    lines: BTreeMap<u8, PvLine>,
}

impl PvCollector {
    pub fn new() -> PvCollector {
        PvCollector::default()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Merge one parsed `info` line; returns whether anything changed.
    pub fn apply(&mut self, info: &InfoLine) -> bool {
        // Pure bookkeeping lines (no depth/score/pv) carry nothing worth
        // consolidating, e.g. `info currmove ...`.
        if info.depth.is_none()
            && info.score.is_none()
            && info.pv.is_none()
            && info.nodes.is_none()
            && info.nps.is_none()
            && info.hashfull.is_none()
        {
            return false;
        }
        let index = info.multipv.unwrap_or(1);
        let line = self
            .lines
            .entry(index)
            .or_insert_with(|| PvLine::empty(index));
        if let Some(depth) = info.depth {
            line.depth = depth;
        }
        if let Some(seldepth) = info.seldepth {
            line.seldepth = Some(seldepth);
        }
        if let Some(nodes) = info.nodes {
            line.nodes = Some(nodes);
        }
        if let Some(nps) = info.nps {
            line.nps = Some(nps);
        }
        if let Some(hashfull) = info.hashfull {
            line.hashfull = Some(hashfull);
        }
        if let Some((score_type, value)) = info.score {
            line.score_type = score_type;
            line.score_value = value;
        }
        if let Some(pv) = &info.pv {
            line.pv_usi = pv.clone();
        }
        true
    }

    /// Current consolidated set, ordered by `pv_index`.
    pub fn lines(&self) -> Vec<PvLine> {
        self.lines.values().cloned().collect()
    }
}

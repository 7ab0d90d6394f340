//! Pluggable kifu format codecs.
//!
//! The core ships a USI codec and the detection heuristics; KIF/KIF2
//! grammars are external collaborators that register through the same
//! [`FormatCodec`] capability set. Asking for an unregistered format fails
//! with `Unsupported` rather than guessing.

mod usi;

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::tree::GameTree;

pub use usi::UsiCodec;

/// Supported kifu text formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Kif,
    Kif2,
    Usi,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Kif => "kif",
            Format::Kif2 => "kif2",
            Format::Usi => "usi",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Format> {
        match tag.to_ascii_lowercase().as_str() {
            "kif" => Some(Format::Kif),
            "kif2" | "ki2" => Some(Format::Kif2),
            "usi" => Some(Format::Usi),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed input at line {line}, column {column}: {detail}")]
    Malformed {
        line: usize,
        column: usize,
        detail: String,
    },

    #[error("no codec registered for format '{}'", .0.as_str())]
    Unsupported(Format),
}

/// Emit options; `all_variations` switches the USI emitter from the main
/// line to one `position` line per leaf path.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmitOptions {
    pub all_variations: bool,
}

/// Parse result: the reconstructed tree plus non-fatal warnings.
#[derive(Debug)]
pub struct ParsedGame {
    pub tree: GameTree,
    pub warnings: Vec<String>,
}

/// Capability set of one format: parse and emit, keyed by format tag.
pub trait FormatCodec: Send + Sync {
    fn format(&self) -> Format;
    fn parse(&self, text: &str) -> Result<ParsedGame, CodecError>;
    fn emit(&self, tree: &GameTree, options: EmitOptions) -> Result<String, CodecError>;
}

/// Codec lookup by format tag.
pub struct CodecRegistry {
    codecs: HashMap<Format, Box<dyn FormatCodec>>,
}

impl CodecRegistry {
    pub fn new() -> CodecRegistry {
        CodecRegistry {
            codecs: HashMap::new(),
        }
    }

    /// Registry with the built-in codecs.
    pub fn with_builtin() -> CodecRegistry {
        let mut registry = CodecRegistry::new();
        registry.register(Box::new(UsiCodec));
        registry
    }

    pub fn register(&mut self, codec: Box<dyn FormatCodec>) {
        self.codecs.insert(codec.format(), codec);
    }

    pub fn supported_formats(&self) -> Vec<Format> {
        let mut formats: Vec<Format> = self.codecs.keys().copied().collect();
        formats.sort_by_key(|f| f.as_str());
        formats
    }

    pub fn parse(&self, format: Format, text: &str) -> Result<ParsedGame, CodecError> {
        self.codecs
            .get(&format)
            .ok_or(CodecError::Unsupported(format))?
            .parse(text)
    }

    pub fn emit(
        &self,
        format: Format,
        tree: &GameTree,
        options: EmitOptions,
    ) -> Result<String, CodecError> {
        self.codecs
            .get(&format)
            .ok_or(CodecError::Unsupported(format))?
            .emit(tree, options)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        CodecRegistry::with_builtin()
    }
}

static KIF2_MOVE_LINE: Lazy<Regex> = Lazy::new(|| {
    // Optional move number, then a side mark. Unwrap is fine for a literal.
    Regex::new(r"^\s*(?:\d+\s+)?[▲△▼▽]").unwrap()
});

/// How many leading non-empty lines the detector inspects.
const DETECT_WINDOW: usize = 40;

/// Format autodetection over the leading lines of the text.
///
/// Rules: a `position`/`startpos`/`sfen` lead means USI; KIF headers
/// (handicap, date, player names, the move-table rule) mean KIF; a
/// side-marked move line means KIF2 unless KIF headers are also present.
/// Conflicting signals fall back to `None` rather than a guess.
pub fn detect(text: &str) -> Option<Format> {
    let mut saw_usi = false;
    let mut saw_kif_header = false;
    let mut saw_kif2_moves = false;

    for line in text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(DETECT_WINDOW)
    {
        if line.starts_with("position ") || line.starts_with("sfen ") || line == "startpos" {
            saw_usi = true;
        } else if line.contains("手合割")
            || line.starts_with("開始日時")
            || line.starts_with("先手：")
            || line.starts_with("後手：")
            || line.contains("手数----")
        {
            saw_kif_header = true;
        } else if KIF2_MOVE_LINE.is_match(line) {
            saw_kif2_moves = true;
        }
    }

    match (saw_usi, saw_kif_header, saw_kif2_moves) {
        (true, false, false) => Some(Format::Usi),
        (false, true, _) => Some(Format::Kif),
        (false, false, true) => Some(Format::Kif2),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shogi::STARTPOS_SFEN;

    #[test]
    fn detects_usi_text() {
        let text = format!("position sfen {STARTPOS_SFEN} moves 7g7f 3c3d\n");
        assert_eq!(detect(&text), Some(Format::Usi));
        assert_eq!(detect("position startpos moves 7g7f"), Some(Format::Usi));
    }

    #[test]
    fn detects_kif_headers() {
        let text = "開始日時：2023/01/15\n手合割：平手\n先手：羽生善治\n後手：藤井聡太\n\
                    手数----指手---------消費時間--\n   1 ７六歩(77)\n";
        assert_eq!(detect(text), Some(Format::Kif));
    }

    #[test]
    fn detects_kif2_side_marks() {
        let text = "▲７六歩 △３四歩 ▲２六歩\n△８四歩 ▲２五歩\n";
        assert_eq!(detect(text), Some(Format::Kif2));
    }

    #[test]
    fn kif_headers_win_over_side_marks() {
        let text = "手合割：平手\n▲７六歩\n";
        assert_eq!(detect(text), Some(Format::Kif));
    }

    #[test]
    fn ambiguous_or_unknown_text_is_rejected() {
        assert_eq!(detect(""), None);
        assert_eq!(detect("hello world\n"), None);
        let conflicted = "position startpos moves 7g7f\n手合割：平手\n";
        assert_eq!(detect(conflicted), None);
    }

    #[test]
    fn registry_rejects_unregistered_formats() {
        let registry = CodecRegistry::with_builtin();
        assert_eq!(registry.supported_formats(), vec![Format::Usi]);
        let tree = GameTree::create("t", STARTPOS_SFEN).unwrap();
        assert!(matches!(
            registry.emit(Format::Kif, &tree, EmitOptions::default()),
            Err(CodecError::Unsupported(Format::Kif))
        ));
        assert!(matches!(
            registry.parse(Format::Kif2, "▲７六歩"),
            Err(CodecError::Unsupported(Format::Kif2))
        ));
    }

    #[test]
    fn format_tags_round_trip() {
        assert_eq!(Format::from_tag("kif"), Some(Format::Kif));
        assert_eq!(Format::from_tag("KI2"), Some(Format::Kif2));
        assert_eq!(Format::from_tag("usi"), Some(Format::Usi));
        assert_eq!(Format::from_tag("pgn"), None);
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form game header data (players, event, handicap).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameMeta {
    pub black: Option<String>,
    pub white: Option<String>,
    pub event: Option<String>,
    pub date: Option<String>,
    pub handicap: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Per-game UI preferences. `analysis_enabled` persists but is never
/// honored when a game is loaded or restored; analysis must be re-enabled
/// explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UiState {
    pub flip: bool,
    pub multipv: u8,
    pub analysis_enabled: bool,
    pub scale: f64,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            flip: false,
            multipv: 1,
            analysis_enabled: false,
            scale: 1.0,
        }
    }
}

/// A stored game. `root_node_id` and `current_node_id` always resolve to
/// nodes of this game.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub initial_sfen: String,
    pub root_node_id: String,
    pub current_node_id: String,
    pub meta: GameMeta,
    pub ui_state: UiState,
}

/// One position in a game's variation tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub game_id: String,
    /// `None` iff this is the root.
    pub parent_id: Option<String>,
    pub order_index: u32,
    /// `None` iff this is the root.
    pub move_usi: Option<String>,
    pub comment: String,
    pub position_sfen: String,
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// Display label; the root shows as "start", every other node shows
    /// its move.
    pub fn label(&self) -> String {
        self.move_usi.clone().unwrap_or_else(|| "start".to_string())
    }
}

/// Flat node representation carried in `game:state` broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub id: String,
    pub parent_id: Option<String>,
    pub order_index: u32,
    pub move_usi: Option<String>,
    pub label: String,
    pub comment: String,
    pub position_sfen: String,
}

impl From<&Node> for NodeView {
    fn from(node: &Node) -> Self {
        NodeView {
            id: node.id.clone(),
            parent_id: node.parent_id.clone(),
            order_index: node.order_index,
            move_usi: node.move_usi.clone(),
            label: node.label(),
            comment: node.comment.clone(),
            position_sfen: node.position_sfen.clone(),
        }
    }
}

/// The authoritative snapshot delivered with `session:granted` and every
/// `game:state` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullGameState {
    pub game_id: String,
    pub title: String,
    pub meta: GameMeta,
    pub initial_sfen: String,
    pub current_position_sfen: String,
    pub root_node_id: String,
    pub current_node_id: String,
    pub nodes: Vec<NodeView>,
    pub children_index: BTreeMap<String, Vec<String>>,
    pub current_path_node_ids: Vec<String>,
    pub ui_state: UiState,
}

/// Summary row for the paginated game list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

//! In-memory authoritative game tree.
//!
//! Owned exclusively by the state synchronizer task; no locking here. Every
//! node caches its `position_sfen` so engine `position` commands for deep
//! nodes stay O(depth) instead of O(depth^2).

mod types;

use std::collections::HashMap;

use chrono::Utc;
use log::debug;
use uuid::Uuid;

use crate::shogi::{self, SfenError};

pub use types::{FullGameState, Game, GameMeta, GameSummary, Node, NodeView, UiState};

/// Tree-mutation failures, surfaced to the owner as error toasts.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("bad permutation for parent {0}")]
    BadPermutation(String),

    #[error("invalid move: {0}")]
    InvalidMove(String),
}

impl From<SfenError> for TreeError {
    fn from(err: SfenError) -> Self {
        TreeError::InvalidMove(err.to_string())
    }
}

/// One game plus its node set and children index.
#[derive(Debug, Clone)]
pub struct GameTree {
    game: Game,
    nodes: HashMap<String, Node>,
    /// parent id -> child ids ordered by `order_index`.
    children: HashMap<String, Vec<String>>,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Dedup normalization: lowercase, trimmed. The stored move keeps its
/// original (trimmed) spelling.
fn moves_equal(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

impl GameTree {
    /// Create a fresh game rooted at `initial_sfen` (validated).
    pub fn create(title: &str, initial_sfen: &str) -> Result<GameTree, TreeError> {
        shogi::Position::from_sfen(initial_sfen)?;
        let now = Utc::now();
        let game_id = new_id();
        let root = Node {
            id: new_id(),
            game_id: game_id.clone(),
            parent_id: None,
            order_index: 0,
            move_usi: None,
            comment: String::new(),
            position_sfen: initial_sfen.to_string(),
            created_at: now,
        };
        let game = Game {
            id: game_id,
            title: title.to_string(),
            created_at: now,
            updated_at: now,
            initial_sfen: initial_sfen.to_string(),
            root_node_id: root.id.clone(),
            current_node_id: root.id.clone(),
            meta: GameMeta::default(),
            ui_state: UiState::default(),
        };
        let mut nodes = HashMap::new();
        nodes.insert(root.id.clone(), root);
        Ok(GameTree {
            game,
            nodes,
            children: HashMap::new(),
        })
    }

    /// Rebuild a tree from persisted rows. The children index is derived
    /// from `parent_id`/`order_index`; a dangling cursor falls back to the
    /// root rather than failing the load.
    pub fn from_parts(mut game: Game, node_rows: Vec<Node>) -> Result<GameTree, TreeError> {
        let mut nodes = HashMap::with_capacity(node_rows.len());
        let mut children: HashMap<String, Vec<(u32, String)>> = HashMap::new();
        for node in node_rows {
            if let Some(parent) = &node.parent_id {
                children
                    .entry(parent.clone())
                    .or_default()
                    .push((node.order_index, node.id.clone()));
            }
            nodes.insert(node.id.clone(), node);
        }
        if !nodes.contains_key(&game.root_node_id) {
            return Err(TreeError::UnknownNode(game.root_node_id.clone()));
        }
        if !nodes.contains_key(&game.current_node_id) {
            debug!(
                "game {}: cursor {} missing, resetting to root",
                game.id, game.current_node_id
            );
            game.current_node_id = game.root_node_id.clone();
        }
        let children = children
            .into_iter()
            .map(|(parent, mut kids)| {
                kids.sort_by_key(|(order, _)| *order);
                (parent, kids.into_iter().map(|(_, id)| id).collect())
            })
            .collect();
        Ok(GameTree {
            game,
            nodes,
            children,
        })
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut Game {
        &mut self.game
    }

    pub fn node(&self, id: &str) -> Result<&Node, TreeError> {
        self.nodes
            .get(id)
            .ok_or_else(|| TreeError::UnknownNode(id.to_string()))
    }

    pub fn current_node(&self) -> &Node {
        // The cursor invariant is maintained by every mutation below.
        self.nodes
            .get(&self.game.current_node_id)
            .unwrap_or_else(|| unreachable!("cursor resolves to a node"))
    }

    pub fn children_of(&self, id: &str) -> Result<&[String], TreeError> {
        self.node(id)?;
        Ok(self.children.get(id).map(Vec::as_slice).unwrap_or(&[]))
    }

    pub fn parent_of(&self, id: &str) -> Result<Option<&Node>, TreeError> {
        let node = self.node(id)?;
        match &node.parent_id {
            Some(parent) => Ok(Some(self.node(parent)?)),
            None => Ok(None),
        }
    }

    pub fn first_child_of(&self, id: &str) -> Result<Option<&Node>, TreeError> {
        match self.children_of(id)?.first() {
            Some(child) => Ok(Some(self.node(child)?)),
            None => Ok(None),
        }
    }

    /// Play a move from a node. Returns `(node_id, created)`; when an equal
    /// child already exists it is reused and the cursor just moves there.
    pub fn play_move(&mut self, from_node_id: &str, move_usi: &str) -> Result<(String, bool), TreeError> {
        let parent = self.node(from_node_id)?;
        let parent_sfen = parent.position_sfen.clone();

        if let Some(existing) = self
            .children_of(from_node_id)?
            .iter()
            .find(|child_id| {
                self.nodes
                    .get(*child_id)
                    .and_then(|c| c.move_usi.as_deref())
                    .map(|m| moves_equal(m, move_usi))
                    .unwrap_or(false)
            })
            .cloned()
        {
            debug!("play_move dedup: {} -> {}", move_usi.trim(), existing);
            self.game.current_node_id = existing.clone();
            self.touch();
            return Ok((existing, false));
        }

        let position_sfen = shogi::apply_move_sfen(&parent_sfen, move_usi)?;
        let order_index = self.children_of(from_node_id)?.len() as u32;
        let node = Node {
            id: new_id(),
            game_id: self.game.id.clone(),
            parent_id: Some(from_node_id.to_string()),
            order_index,
            move_usi: Some(move_usi.trim().to_string()),
            comment: String::new(),
            position_sfen,
            created_at: Utc::now(),
        };
        let id = node.id.clone();
        self.children
            .entry(from_node_id.to_string())
            .or_default()
            .push(id.clone());
        self.nodes.insert(id.clone(), node);
        self.game.current_node_id = id.clone();
        self.touch();
        Ok((id, true))
    }

    pub fn jump(&mut self, node_id: &str) -> Result<(), TreeError> {
        self.node(node_id)?;
        self.game.current_node_id = node_id.to_string();
        self.touch();
        Ok(())
    }

    /// Rewrite sibling order under one parent. The provided list must be a
    /// permutation of the current children; applied all-or-nothing. The
    /// cursor is untouched: order is presentation only.
    pub fn reorder_children(
        &mut self,
        parent_id: &str,
        ordered_child_ids: &[String],
    ) -> Result<(), TreeError> {
        let current = self.children_of(parent_id)?.to_vec();
        if current.len() != ordered_child_ids.len() {
            return Err(TreeError::BadPermutation(parent_id.to_string()));
        }
        let mut a = current.clone();
        let mut b = ordered_child_ids.to_vec();
        a.sort();
        b.sort();
        if a != b {
            return Err(TreeError::BadPermutation(parent_id.to_string()));
        }
        for (index, child_id) in ordered_child_ids.iter().enumerate() {
            if let Some(child) = self.nodes.get_mut(child_id) {
                child.order_index = index as u32;
            }
        }
        self.children
            .insert(parent_id.to_string(), ordered_child_ids.to_vec());
        self.touch();
        Ok(())
    }

    pub fn set_comment(&mut self, node_id: &str, comment: &str) -> Result<(), TreeError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| TreeError::UnknownNode(node_id.to_string()))?;
        node.comment = comment.to_string();
        self.touch();
        Ok(())
    }

    /// Root-to-node id chain. Parent chains always terminate at the root;
    /// nodes are created with an existing parent and never re-parented.
    pub fn path_to(&self, node_id: &str) -> Result<Vec<String>, TreeError> {
        let mut path = Vec::new();
        let mut cursor = self.node(node_id)?;
        loop {
            path.push(cursor.id.clone());
            match &cursor.parent_id {
                Some(parent) => cursor = self.node(parent)?,
                None => break,
            }
        }
        path.reverse();
        Ok(path)
    }

    /// Engine position command for a node: root SFEN plus the move chain.
    pub fn position_command(&self, node_id: &str) -> Result<String, TreeError> {
        let path = self.path_to(node_id)?;
        let moves: Vec<&str> = path
            .iter()
            .filter_map(|id| self.nodes.get(id).and_then(|n| n.move_usi.as_deref()))
            .collect();
        if moves.is_empty() {
            Ok(format!("position sfen {}", self.game.initial_sfen))
        } else {
            Ok(format!(
                "position sfen {} moves {}",
                self.game.initial_sfen,
                moves.join(" ")
            ))
        }
    }

    /// All nodes in breadth-first order (root first, siblings in order).
    pub fn nodes_ordered(&self) -> Vec<&Node> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut queue = vec![self.game.root_node_id.clone()];
        let mut at = 0;
        while at < queue.len() {
            let id = queue[at].clone();
            at += 1;
            if let Some(node) = self.nodes.get(&id) {
                out.push(node);
            }
            if let Some(kids) = self.children.get(&id) {
                queue.extend(kids.iter().cloned());
            }
        }
        out
    }

    pub fn full_state(&self) -> FullGameState {
        let nodes: Vec<NodeView> = self.nodes_ordered().into_iter().map(NodeView::from).collect();
        let children_index = self
            .children
            .iter()
            .map(|(parent, kids)| (parent.clone(), kids.clone()))
            .collect();
        let current_path_node_ids = self
            .path_to(&self.game.current_node_id)
            .unwrap_or_else(|_| vec![self.game.root_node_id.clone()]);
        FullGameState {
            game_id: self.game.id.clone(),
            title: self.game.title.clone(),
            meta: self.game.meta.clone(),
            initial_sfen: self.game.initial_sfen.clone(),
            current_position_sfen: self.current_node().position_sfen.clone(),
            root_node_id: self.game.root_node_id.clone(),
            current_node_id: self.game.current_node_id.clone(),
            nodes,
            children_index,
            current_path_node_ids,
            ui_state: self.game.ui_state.clone(),
        }
    }

    fn touch(&mut self) {
        self.game.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shogi::STARTPOS_SFEN;

    fn tree() -> GameTree {
        GameTree::create("test", STARTPOS_SFEN).unwrap()
    }

    #[test]
    fn play_move_creates_child_and_moves_cursor() {
        let mut t = tree();
        let root = t.game().root_node_id.clone();
        let (id, created) = t.play_move(&root, "7g7f").unwrap();
        assert!(created);
        assert_eq!(t.game().current_node_id, id);
        let node = t.node(&id).unwrap();
        assert_eq!(node.move_usi.as_deref(), Some("7g7f"));
        assert_eq!(node.order_index, 0);
        assert!(node.position_sfen.contains(" w "));
    }

    #[test]
    fn play_move_is_idempotent_per_move() {
        let mut t = tree();
        let root = t.game().root_node_id.clone();
        let (first, created_first) = t.play_move(&root, "7g7f").unwrap();
        t.jump(&root).unwrap();
        let (second, created_second) = t.play_move(&root, " 7G7F ").unwrap();
        assert!(created_first);
        assert!(!created_second);
        assert_eq!(first, second);
        assert_eq!(t.children_of(&root).unwrap().len(), 1);
        assert_eq!(t.game().current_node_id, first);
    }

    #[test]
    fn sibling_order_stays_gapless() {
        let mut t = tree();
        let root = t.game().root_node_id.clone();
        let (a, _) = t.play_move(&root, "7g7f").unwrap();
        t.jump(&root).unwrap();
        let (b, _) = t.play_move(&root, "2g2f").unwrap();
        t.jump(&root).unwrap();
        let (c, _) = t.play_move(&root, "5g5f").unwrap();

        t.reorder_children(&root, &[c.clone(), a.clone(), b.clone()])
            .unwrap();
        let mut orders: Vec<u32> = t
            .children_of(&root)
            .unwrap()
            .iter()
            .map(|id| t.node(id).unwrap().order_index)
            .collect();
        assert_eq!(orders, vec![0, 1, 2]);
        orders.sort();
        assert_eq!(orders, (0..3).collect::<Vec<_>>());
        assert_eq!(t.children_of(&root).unwrap(), &[c, a, b]);
    }

    #[test]
    fn reorder_rejects_non_permutations() {
        let mut t = tree();
        let root = t.game().root_node_id.clone();
        let (a, _) = t.play_move(&root, "7g7f").unwrap();
        t.jump(&root).unwrap();
        let (b, _) = t.play_move(&root, "2g2f").unwrap();

        let err = t.reorder_children(&root, &[a.clone()]).unwrap_err();
        assert!(matches!(err, TreeError::BadPermutation(_)));
        let err = t
            .reorder_children(&root, &[a.clone(), "nope".to_string()])
            .unwrap_err();
        assert!(matches!(err, TreeError::BadPermutation(_)));
        // Untouched on failure.
        assert_eq!(t.children_of(&root).unwrap(), &[a, b]);
    }

    #[test]
    fn reorder_keeps_cursor() {
        let mut t = tree();
        let root = t.game().root_node_id.clone();
        let (a, _) = t.play_move(&root, "7g7f").unwrap();
        t.jump(&root).unwrap();
        let (b, _) = t.play_move(&root, "2g2f").unwrap();
        t.jump(&a).unwrap();
        t.reorder_children(&root, &[b, a.clone()]).unwrap();
        assert_eq!(t.game().current_node_id, a);
    }

    #[test]
    fn sfen_cache_is_coherent() {
        let mut t = tree();
        let root = t.game().root_node_id.clone();
        let (a, _) = t.play_move(&root, "7g7f").unwrap();
        let (b, _) = t.play_move(&a, "3c3d").unwrap();
        for id in [&a, &b] {
            let node = t.node(id).unwrap().clone();
            let parent = t.parent_of(id).unwrap().unwrap();
            let derived =
                crate::shogi::apply_move_sfen(&parent.position_sfen, node.move_usi.as_deref().unwrap())
                    .unwrap();
            assert_eq!(derived, node.position_sfen);
        }
    }

    #[test]
    fn path_terminates_at_root() {
        let mut t = tree();
        let root = t.game().root_node_id.clone();
        let (a, _) = t.play_move(&root, "7g7f").unwrap();
        let (b, _) = t.play_move(&a, "3c3d").unwrap();
        assert_eq!(t.path_to(&b).unwrap(), vec![root.clone(), a, b]);
        assert_eq!(t.path_to(&root).unwrap(), vec![root]);
    }

    #[test]
    fn position_command_includes_move_chain() {
        let mut t = tree();
        let root = t.game().root_node_id.clone();
        assert_eq!(
            t.position_command(&root).unwrap(),
            format!("position sfen {STARTPOS_SFEN}")
        );
        let (a, _) = t.play_move(&root, "7g7f").unwrap();
        let (b, _) = t.play_move(&a, "3c3d").unwrap();
        assert_eq!(
            t.position_command(&b).unwrap(),
            format!("position sfen {STARTPOS_SFEN} moves 7g7f 3c3d")
        );
    }

    #[test]
    fn invalid_move_is_rejected_without_node_creation() {
        let mut t = tree();
        let root = t.game().root_node_id.clone();
        let err = t.play_move(&root, "5e5d").unwrap_err();
        assert!(matches!(err, TreeError::InvalidMove(_)));
        assert!(t.children_of(&root).unwrap().is_empty());
        assert_eq!(t.game().current_node_id, root);
    }

    #[test]
    fn unknown_node_operations_fail() {
        let mut t = tree();
        assert!(matches!(t.jump("missing"), Err(TreeError::UnknownNode(_))));
        assert!(matches!(
            t.play_move("missing", "7g7f"),
            Err(TreeError::UnknownNode(_))
        ));
        assert!(matches!(t.path_to("missing"), Err(TreeError::UnknownNode(_))));
    }

    #[test]
    fn from_parts_restores_children_order_and_cursor() {
        let mut t = tree();
        let root = t.game().root_node_id.clone();
        let (a, _) = t.play_move(&root, "7g7f").unwrap();
        t.jump(&root).unwrap();
        let (b, _) = t.play_move(&root, "2g2f").unwrap();
        t.reorder_children(&root, &[b.clone(), a.clone()]).unwrap();
        t.jump(&a).unwrap();

        let game = t.game().clone();
        let nodes: Vec<Node> = t.nodes_ordered().into_iter().cloned().collect();
        let restored = GameTree::from_parts(game, nodes).unwrap();
        assert_eq!(restored.children_of(&root).unwrap(), &[b, a.clone()]);
        assert_eq!(restored.game().current_node_id, a);
    }

    #[test]
    fn full_state_exposes_children_index_and_path() {
        let mut t = tree();
        let root = t.game().root_node_id.clone();
        let (a, _) = t.play_move(&root, "7g7f").unwrap();
        let state = t.full_state();
        assert_eq!(state.current_node_id, a);
        assert_eq!(state.children_index.get(&root).unwrap(), &vec![a.clone()]);
        assert_eq!(state.current_path_node_ids, vec![root, a]);
        assert_eq!(state.nodes.len(), 2);
        assert_eq!(state.nodes[0].label, "start");
    }
}

//! Durable storage for games, nodes, analysis snapshots, and app state.
//!
//! SQLite via rusqlite; owned exclusively by the state synchronizer task.
//! Tree mutations persist before the corresponding broadcast, so a crash
//! never leaves clients ahead of disk.

use std::path::Path;

use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::engine::{AnalysisSnapshot, EngineSettings, PvLine};
use crate::tree::{Game, GameMeta, GameSummary, Node, UiState};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found")]
    NotFound,

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Process-wide persisted state, stored under one key in `app_state`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppState {
    pub current_game_id: Option<String>,
    pub last_seen_cursor: Option<String>,
    pub engine: EngineSettings,
}

const APP_STATE_KEY: &str = "app";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS games (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    initial_sfen TEXT NOT NULL,
    root_node_id TEXT NOT NULL,
    current_node_id TEXT NOT NULL,
    meta_json TEXT NOT NULL,
    ui_state_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    game_id TEXT NOT NULL REFERENCES games(id) ON DELETE CASCADE,
    parent_id TEXT,
    order_index INTEGER NOT NULL,
    move_usi TEXT,
    comment TEXT NOT NULL DEFAULT '',
    position_sfen TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(parent_id, order_index)
);
CREATE INDEX IF NOT EXISTS idx_nodes_game ON nodes(game_id);
CREATE TABLE IF NOT EXISTS analysis_snapshots (
    id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    elapsed_ms INTEGER NOT NULL,
    multipv INTEGER NOT NULL,
    lines_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_node ON analysis_snapshots(node_id);
CREATE TABLE IF NOT EXISTS app_state (
    k TEXT PRIMARY KEY,
    v TEXT NOT NULL
);
";

pub struct Store {
    conn: Connection,
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{s}': {e}")))
}

impl Store {
    pub fn open(path: &Path) -> StoreResult<Store> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        info!("store opened at {:?}", path);
        Ok(Store { conn })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Store> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Store { conn })
    }

    pub fn put_game(&mut self, game: &Game) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO games (id, title, created_at, updated_at, initial_sfen,
                                root_node_id, current_node_id, meta_json, ui_state_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 title = excluded.title,
                 updated_at = excluded.updated_at,
                 current_node_id = excluded.current_node_id,
                 meta_json = excluded.meta_json,
                 ui_state_json = excluded.ui_state_json",
            params![
                game.id,
                game.title,
                ts(&game.created_at),
                ts(&game.updated_at),
                game.initial_sfen,
                game.root_node_id,
                game.current_node_id,
                serde_json::to_string(&game.meta)?,
                serde_json::to_string(&game.ui_state)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_game_with_tree(&self, id: &str) -> StoreResult<(Game, Vec<Node>)> {
        let game = self
            .conn
            .query_row(
                "SELECT id, title, created_at, updated_at, initial_sfen,
                        root_node_id, current_node_id, meta_json, ui_state_json
                 FROM games WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;

        let meta: GameMeta = serde_json::from_str(&game.7)?;
        let ui_state: UiState = serde_json::from_str(&game.8)?;
        let game = Game {
            id: game.0,
            title: game.1,
            created_at: parse_ts(&game.2)?,
            updated_at: parse_ts(&game.3)?,
            initial_sfen: game.4,
            root_node_id: game.5,
            current_node_id: game.6,
            meta,
            ui_state,
        };

        let mut stmt = self.conn.prepare(
            "SELECT id, game_id, parent_id, order_index, move_usi, comment,
                    position_sfen, created_at
             FROM nodes WHERE game_id = ?1
             ORDER BY parent_id, order_index",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        let mut nodes = Vec::new();
        for row in rows {
            let row = row?;
            nodes.push(Node {
                id: row.0,
                game_id: row.1,
                parent_id: row.2,
                order_index: u32::try_from(row.3)
                    .map_err(|_| StoreError::Corrupt(format!("negative order_index {}", row.3)))?,
                move_usi: row.4,
                comment: row.5,
                position_sfen: row.6,
                created_at: parse_ts(&row.7)?,
            });
        }
        Ok((game, nodes))
    }

    pub fn list_games(&self, limit: u32, offset: u32) -> StoreResult<(Vec<GameSummary>, u64)> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM games", [], |row| row.get(0))?;
        let mut stmt = self.conn.prepare(
            "SELECT id, title, created_at, updated_at FROM games
             ORDER BY updated_at DESC, id LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut items = Vec::new();
        for row in rows {
            let row = row?;
            items.push(GameSummary {
                id: row.0,
                title: row.1,
                created_at: parse_ts(&row.2)?,
                updated_at: parse_ts(&row.3)?,
            });
        }
        Ok((items, total as u64))
    }

    pub fn delete_game(&mut self, id: &str) -> StoreResult<()> {
        let affected = self.conn.execute("DELETE FROM games WHERE id = ?1", params![id])?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        debug!("deleted game {id}");
        Ok(())
    }

    pub fn upsert_node(&mut self, node: &Node) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO nodes (id, game_id, parent_id, order_index, move_usi,
                                comment, position_sfen, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 order_index = excluded.order_index,
                 comment = excluded.comment",
            params![
                node.id,
                node.game_id,
                node.parent_id,
                node.order_index,
                node.move_usi,
                node.comment,
                node.position_sfen,
                ts(&node.created_at),
            ],
        )?;
        Ok(())
    }

    /// Rewrite `order_index` for one parent's children in a single
    /// transaction. Indices are parked in a negative range first so the
    /// `UNIQUE(parent_id, order_index)` constraint holds mid-rewrite.
    pub fn rewrite_children_order(&mut self, parent_id: &str, ids: &[String]) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        for (i, id) in ids.iter().enumerate() {
            let affected = tx.execute(
                "UPDATE nodes SET order_index = ?1 WHERE id = ?2 AND parent_id = ?3",
                params![-(i as i64) - 1, id, parent_id],
            )?;
            if affected != 1 {
                return Err(StoreError::Corrupt(format!(
                    "node {id} is not a child of {parent_id}"
                )));
            }
        }
        for (i, id) in ids.iter().enumerate() {
            tx.execute(
                "UPDATE nodes SET order_index = ?1 WHERE id = ?2",
                params![i as i64, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn append_snapshot(&mut self, snapshot: &AnalysisSnapshot) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO analysis_snapshots (id, node_id, elapsed_ms, multipv,
                                             lines_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                snapshot.id,
                snapshot.node_id,
                snapshot.elapsed_ms as i64,
                snapshot.multipv,
                serde_json::to_string(&snapshot.lines)?,
                ts(&snapshot.created_at),
            ],
        )?;
        Ok(())
    }

    /// Snapshot history for one node, oldest first.
    pub fn snapshots_for_node(&self, node_id: &str) -> StoreResult<Vec<AnalysisSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, node_id, elapsed_ms, multipv, lines_json, created_at
             FROM analysis_snapshots WHERE node_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![node_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let row = row?;
            let lines: Vec<PvLine> = serde_json::from_str(&row.4)?;
            out.push(AnalysisSnapshot {
                id: row.0,
                node_id: row.1,
                elapsed_ms: row.2 as u64,
                multipv: row.3 as u8,
                lines,
                created_at: parse_ts(&row.5)?,
            });
        }
        Ok(out)
    }

    pub fn put_app_state(&mut self, state: &AppState) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO app_state (k, v) VALUES (?1, ?2)
             ON CONFLICT(k) DO UPDATE SET v = excluded.v",
            params![APP_STATE_KEY, serde_json::to_string(state)?],
        )?;
        Ok(())
    }

    /// `None` on a fresh database (first run).
    pub fn get_app_state(&self) -> StoreResult<Option<AppState>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT v FROM app_state WHERE k = ?1",
                params![APP_STATE_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(v) => Ok(Some(serde_json::from_str(&v)?)),
            None => Ok(None),
        }
    }
}

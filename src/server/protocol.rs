//! Wire protocol: the JSON envelope and typed payloads.
//!
//! Incoming frames are `{"type", "payload", "session_id"?, "owner_token"?}`.
//! Owner-authored types must carry the freshness token pair; non-owners may
//! only send `session:takeover`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::Format;
use crate::engine::{EngineStatus, PvLine};
use crate::tree::{FullGameState, GameMeta};

// =============================================================================
// Envelope
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub owner_token: Option<String>,
}

// =============================================================================
// Incoming payloads
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayMovePayload {
    pub from_node_id: String,
    pub move_usi: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JumpPayload {
    pub node_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderPayload {
    pub parent_id: String,
    pub ordered_child_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCommentPayload {
    pub node_id: String,
    pub comment: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadGamePayload {
    pub game_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetEnabledPayload {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMultiPvPayload {
    pub multipv: u8,
}

// =============================================================================
// Outgoing payloads
// =============================================================================

/// Server capabilities advertised with `session:granted`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub formats: Vec<Format>,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantedPayload {
    pub session_id: String,
    pub owner_token: String,
    pub since: DateTime<Utc>,
    pub state: FullGameState,
    pub capabilities: Capabilities,
    pub engine: EngineStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusyPayload {
    pub owner_since: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KickedPayload {
    pub reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisUpdatePayload {
    pub node_id: String,
    pub elapsed_ms: u64,
    pub multipv: u8,
    pub lines: Vec<PvLine>,
    /// Convenience copy of the pv_index=1 line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best: Option<PvLine>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStoppedPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToastPayload {
    pub level: &'static str,
    pub message: String,
}

/// `PUT /api/games/{id}` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGameBody {
    pub title: Option<String>,
    pub meta: Option<GameMeta>,
}

/// `POST /api/import` body and response.
#[derive(Debug, Deserialize)]
pub struct ImportBody {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub format: Format,
    pub game_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameListPage {
    pub items: Vec<crate::tree::GameSummary>,
    pub total: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub engine_ok: bool,
}

//! State synchronizer: the single writer over tree, session slot, app
//! state, and store.
//!
//! Every mutation — WebSocket frame or HTTP request — arrives here as an
//! intent and is applied in order: mutate, persist, then broadcast. Analysis
//! snapshot persists ride the same task through a side channel, so per-node
//! write order is preserved without blocking the broadcast path.

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::analysis::AnalysisHandle;
use crate::codec::{self, CodecRegistry, EmitOptions, Format};
use crate::engine::AnalysisSnapshot;
use crate::error::Error;
use crate::server::hub::{frame, Hub};
use crate::server::protocol::{
    BusyPayload, Capabilities, Envelope, GameListPage, GrantedPayload, ImportOutcome, JumpPayload,
    KickedPayload, LoadGamePayload, PlayMovePayload, ReorderPayload, SetCommentPayload,
    SetEnabledPayload, SetMultiPvPayload, ToastPayload, UpdateGameBody,
};
use crate::engine::StatusCell;
use crate::session::{Admission, SessionManager};
use crate::shogi::STARTPOS_SFEN;
use crate::store::{AppState, Store};
use crate::tree::{FullGameState, GameTree};

pub type Reply<T> = oneshot::Sender<Result<T, Error>>;

/// HTTP-originated requests, serialized through the synchronizer.
pub enum ApiRequest {
    ListGames {
        limit: u32,
        offset: u32,
        reply: Reply<GameListPage>,
    },
    CreateGame {
        reply: Reply<FullGameState>,
    },
    GetGame {
        id: String,
        reply: Reply<FullGameState>,
    },
    UpdateGame {
        id: String,
        body: UpdateGameBody,
        reply: Reply<FullGameState>,
    },
    DeleteGame {
        id: String,
        reply: Reply<()>,
    },
    Import {
        text: String,
        reply: Reply<ImportOutcome>,
    },
    Export {
        id: String,
        format: Format,
        all_variations: bool,
        reply: Reply<String>,
    },
}

/// Everything the synchronizer can be asked to do.
pub enum Intent {
    Connected { conn_id: u64 },
    Disconnected { conn_id: u64 },
    Frame { conn_id: u64, envelope: Envelope },
    Api(ApiRequest),
}

pub struct Synchronizer {
    intents: mpsc::UnboundedReceiver<Intent>,
    snapshots: mpsc::UnboundedReceiver<AnalysisSnapshot>,
    store: Store,
    tree: GameTree,
    app_state: AppState,
    sessions: SessionManager,
    hub: Hub,
    analysis: AnalysisHandle,
    codecs: CodecRegistry,
    engine_status: StatusCell,
    analysis_enabled: bool,
}

impl Synchronizer {
    /// Restore the current game from disk (creating one on first run) and
    /// assemble the synchronizer. Analysis always starts disabled.
    /// `engine_settings` are the effective settings (persisted or config
    /// defaults) and are written back to app state.
    #[allow(clippy::too_many_arguments)]
    pub fn bootstrap(
        mut store: Store,
        intents: mpsc::UnboundedReceiver<Intent>,
        snapshots: mpsc::UnboundedReceiver<AnalysisSnapshot>,
        hub: Hub,
        analysis: AnalysisHandle,
        codecs: CodecRegistry,
        engine_status: StatusCell,
        engine_settings: crate::engine::EngineSettings,
    ) -> Result<Synchronizer, Error> {
        let mut app_state = store.get_app_state()?.unwrap_or_default();
        app_state.engine = engine_settings;

        let tree = match &app_state.current_game_id {
            Some(game_id) => match store.get_game_with_tree(game_id) {
                Ok((game, nodes)) => {
                    info!("restored game {} ({} nodes)", game.id, nodes.len());
                    GameTree::from_parts(game, nodes)?
                }
                Err(crate::store::StoreError::NotFound) => {
                    warn!("persisted current game {game_id} is gone, starting fresh");
                    Self::create_and_persist(&mut store)?
                }
                Err(e) => return Err(e.into()),
            },
            None => Self::create_and_persist(&mut store)?,
        };

        let mut tree = tree;
        // `analysis_enabled` is never honored across a restart.
        tree.game_mut().ui_state.analysis_enabled = false;
        app_state.current_game_id = Some(tree.game().id.clone());
        store.put_app_state(&app_state)?;

        Ok(Synchronizer {
            intents,
            snapshots,
            store,
            tree,
            app_state,
            sessions: SessionManager::new(),
            hub,
            analysis,
            codecs,
            engine_status,
            analysis_enabled: false,
        })
    }

    fn create_and_persist(store: &mut Store) -> Result<GameTree, Error> {
        let tree = GameTree::create("New game", STARTPOS_SFEN)?;
        store.put_game(tree.game())?;
        let root = tree.game().root_node_id.clone();
        store.upsert_node(tree.node(&root)?)?;
        info!("created game {}", tree.game().id);
        Ok(tree)
    }

    pub async fn run(mut self) {
        // Tell the coordinator where the cursor is before any intent.
        self.notify_node_changed().await;
        loop {
            tokio::select! {
                intent = self.intents.recv() => {
                    match intent {
                        Some(intent) => self.handle_intent(intent).await,
                        None => break,
                    }
                }
                snapshot = self.snapshots.recv() => {
                    if let Some(snapshot) = snapshot {
                        if let Err(e) = self.store.append_snapshot(&snapshot) {
                            warn!("snapshot persist failed: {e}");
                        }
                    }
                }
            }
        }
        info!("synchronizer stopped");
    }

    async fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Connected { conn_id } => self.handle_connected(conn_id),
            Intent::Disconnected { conn_id } => self.handle_disconnected(conn_id).await,
            Intent::Frame { conn_id, envelope } => self.handle_frame(conn_id, envelope).await,
            Intent::Api(request) => self.handle_api(request).await,
        }
    }

    fn handle_connected(&mut self, conn_id: u64) {
        match self.sessions.admit(conn_id) {
            Admission::Granted(grant) => {
                self.hub.send_to(
                    conn_id,
                    frame(
                        "session:granted",
                        GrantedPayload {
                            session_id: grant.session_id,
                            owner_token: grant.owner_token,
                            since: grant.since,
                            state: self.tree.full_state(),
                            capabilities: self.capabilities(),
                            engine: self.engine_status.snapshot(),
                        },
                    ),
                );
            }
            Admission::Busy { owner_since } => {
                self.hub
                    .send_to(conn_id, frame("session:busy", BusyPayload { owner_since }));
            }
        }
    }

    async fn handle_disconnected(&mut self, conn_id: u64) {
        self.hub.close(conn_id);
        if self.sessions.clear_conn(conn_id) {
            // Owner gone: analysis stops until someone owns the session.
            self.analysis_enabled = false;
            self.tree.game_mut().ui_state.analysis_enabled = false;
            if let Err(e) = self.store.put_game(self.tree.game()) {
                warn!("persist on owner disconnect failed: {e}");
            }
            self.analysis.set_enabled(false).await;
        }
    }

    async fn handle_frame(&mut self, conn_id: u64, envelope: Envelope) {
        if envelope.kind == "session:takeover" {
            self.handle_takeover(conn_id);
            return;
        }

        // Freshness gate: matching tokens prove ownership. A mismatch with
        // tokens attached gets a stale notice; token-less frames from
        // non-owners are dropped silently.
        let fresh = self.sessions.is_fresh(
            envelope.session_id.as_deref(),
            envelope.owner_token.as_deref(),
        );
        if !fresh {
            if envelope.session_id.is_some() || envelope.owner_token.is_some() {
                debug!("stale frame '{}' from conn {conn_id}", envelope.kind);
                self.hub
                    .send_to(conn_id, frame("session:stale", serde_json::json!({})));
            } else {
                debug!("dropping non-owner frame '{}' from conn {conn_id}", envelope.kind);
            }
            return;
        }

        if let Err(e) = self.apply_owner_frame(conn_id, &envelope).await {
            self.toast(conn_id, "error", e.to_string());
        }
    }

    fn handle_takeover(&mut self, conn_id: u64) {
        let (grant, displaced) = self.sessions.takeover(conn_id);
        if let Some(old) = displaced {
            self.hub.send_to(
                old.conn_id,
                frame("session:kicked", KickedPayload { reason: "takeover" }),
            );
            self.hub.close(old.conn_id);
        }
        self.hub.send_to(
            conn_id,
            frame(
                "session:granted",
                GrantedPayload {
                    session_id: grant.session_id,
                    owner_token: grant.owner_token,
                    since: grant.since,
                    state: self.tree.full_state(),
                    capabilities: self.capabilities(),
                    engine: self.engine_status.snapshot(),
                },
            ),
        );
    }

    async fn apply_owner_frame(&mut self, conn_id: u64, envelope: &Envelope) -> Result<(), Error> {
        let payload = envelope.payload.clone();
        match envelope.kind.as_str() {
            "game:new" => self.op_game_new().await,
            "game:load" => {
                let p: LoadGamePayload = parse_payload(payload)?;
                self.op_game_load(&p.game_id).await
            }
            "game:save" => self.op_game_save(conn_id),
            "node:play_move" => {
                let p: PlayMovePayload = parse_payload(payload)?;
                self.op_play_move(&p.from_node_id, &p.move_usi).await
            }
            "node:jump" => {
                let p: JumpPayload = parse_payload(payload)?;
                self.op_jump(&p.node_id).await
            }
            "node:reorder_children" => {
                let p: ReorderPayload = parse_payload(payload)?;
                self.op_reorder(&p.parent_id, &p.ordered_child_ids)
            }
            "node:set_comment" => {
                let p: SetCommentPayload = parse_payload(payload)?;
                self.op_set_comment(&p.node_id, &p.comment)
            }
            "analysis:set_enabled" => {
                let p: SetEnabledPayload = parse_payload(payload)?;
                self.op_set_enabled(p.enabled).await
            }
            "analysis:start" => self.op_set_enabled(true).await,
            "analysis:stop" => self.op_set_enabled(false).await,
            "analysis:set_multipv" => {
                let p: SetMultiPvPayload = parse_payload(payload)?;
                self.op_set_multipv(p.multipv).await
            }
            other => {
                debug!("unknown frame type '{other}' from conn {conn_id}");
                Ok(())
            }
        }
    }

    // =========================================================================
    // Owner operations: mutate, persist, notify analysis, broadcast
    // =========================================================================

    async fn op_game_new(&mut self) -> Result<(), Error> {
        let mut tree = GameTree::create("New game", STARTPOS_SFEN)?;
        tree.game_mut().ui_state.analysis_enabled = self.analysis_enabled;
        self.store.put_game(tree.game())?;
        let root = tree.game().root_node_id.clone();
        self.store.upsert_node(tree.node(&root)?)?;

        self.tree = tree;
        self.app_state.current_game_id = Some(self.tree.game().id.clone());
        self.app_state.last_seen_cursor = Some(root);
        self.store.put_app_state(&self.app_state)?;

        self.notify_node_changed().await;
        self.broadcast_state();
        Ok(())
    }

    async fn op_game_load(&mut self, game_id: &str) -> Result<(), Error> {
        let (game, nodes) = self.store.get_game_with_tree(game_id)?;
        let mut tree = GameTree::from_parts(game, nodes)?;
        // Loading never resumes analysis implicitly.
        tree.game_mut().ui_state.analysis_enabled = false;
        self.analysis_enabled = false;
        self.analysis.set_enabled(false).await;

        self.tree = tree;
        self.app_state.current_game_id = Some(self.tree.game().id.clone());
        self.app_state.last_seen_cursor = Some(self.tree.game().current_node_id.clone());
        self.store.put_app_state(&self.app_state)?;
        self.store.put_game(self.tree.game())?;

        self.notify_node_changed().await;
        self.broadcast_state();
        Ok(())
    }

    fn op_game_save(&mut self, conn_id: u64) -> Result<(), Error> {
        self.store.put_game(self.tree.game())?;
        self.store.put_app_state(&self.app_state)?;
        self.toast(conn_id, "info", "game saved".to_string());
        Ok(())
    }

    async fn op_play_move(&mut self, from_node_id: &str, move_usi: &str) -> Result<(), Error> {
        let (node_id, created) = self.tree.play_move(from_node_id, move_usi)?;
        if created {
            self.store.upsert_node(self.tree.node(&node_id)?)?;
        }
        self.store.put_game(self.tree.game())?;
        self.app_state.last_seen_cursor = Some(node_id);
        self.store.put_app_state(&self.app_state)?;

        self.notify_node_changed().await;
        self.broadcast_state();
        Ok(())
    }

    async fn op_jump(&mut self, node_id: &str) -> Result<(), Error> {
        self.tree.jump(node_id)?;
        self.store.put_game(self.tree.game())?;
        self.app_state.last_seen_cursor = Some(node_id.to_string());
        self.store.put_app_state(&self.app_state)?;

        self.notify_node_changed().await;
        self.broadcast_state();
        Ok(())
    }

    fn op_reorder(&mut self, parent_id: &str, ordered: &[String]) -> Result<(), Error> {
        self.tree.reorder_children(parent_id, ordered)?;
        self.store.rewrite_children_order(parent_id, ordered)?;
        self.store.put_game(self.tree.game())?;
        self.broadcast_state();
        Ok(())
    }

    fn op_set_comment(&mut self, node_id: &str, comment: &str) -> Result<(), Error> {
        self.tree.set_comment(node_id, comment)?;
        self.store.upsert_node(self.tree.node(node_id)?)?;
        self.store.put_game(self.tree.game())?;
        self.broadcast_state();
        Ok(())
    }

    async fn op_set_enabled(&mut self, enabled: bool) -> Result<(), Error> {
        self.analysis_enabled = enabled;
        self.tree.game_mut().ui_state.analysis_enabled = enabled;
        self.store.put_game(self.tree.game())?;
        self.analysis.set_enabled(enabled).await;
        self.broadcast_state();
        Ok(())
    }

    async fn op_set_multipv(&mut self, multipv: u8) -> Result<(), Error> {
        if !(1..=5).contains(&multipv) {
            return Err(Error::BadRequest(format!(
                "multipv must be between 1 and 5, got {multipv}"
            )));
        }
        self.tree.game_mut().ui_state.multipv = multipv;
        self.store.put_game(self.tree.game())?;
        self.app_state.engine.multipv = multipv;
        self.store.put_app_state(&self.app_state)?;
        self.analysis.set_multipv(multipv).await;
        self.broadcast_state();
        Ok(())
    }

    // =========================================================================
    // HTTP requests
    // =========================================================================

    async fn handle_api(&mut self, request: ApiRequest) {
        match request {
            ApiRequest::ListGames {
                limit,
                offset,
                reply,
            } => {
                let result = self
                    .store
                    .list_games(limit, offset)
                    .map(|(items, total)| GameListPage { items, total })
                    .map_err(Error::from);
                let _ = reply.send(result);
            }
            ApiRequest::CreateGame { reply } => {
                let _ = reply.send(self.api_create_game());
            }
            ApiRequest::GetGame { id, reply } => {
                let _ = reply.send(self.load_state(&id));
            }
            ApiRequest::UpdateGame { id, body, reply } => {
                let _ = reply.send(self.api_update_game(&id, body));
            }
            ApiRequest::DeleteGame { id, reply } => {
                let _ = reply.send(self.api_delete_game(&id));
            }
            ApiRequest::Import { text, reply } => {
                let _ = reply.send(self.api_import(&text));
            }
            ApiRequest::Export {
                id,
                format,
                all_variations,
                reply,
            } => {
                let _ = reply.send(self.api_export(&id, format, all_variations));
            }
        }
    }

    fn api_create_game(&mut self) -> Result<FullGameState, Error> {
        let tree = GameTree::create("New game", STARTPOS_SFEN)?;
        self.store.put_game(tree.game())?;
        let root = tree.game().root_node_id.clone();
        self.store.upsert_node(tree.node(&root)?)?;
        Ok(tree.full_state())
    }

    fn load_state(&self, id: &str) -> Result<FullGameState, Error> {
        if id == self.tree.game().id {
            return Ok(self.tree.full_state());
        }
        let (game, nodes) = self.store.get_game_with_tree(id)?;
        Ok(GameTree::from_parts(game, nodes)?.full_state())
    }

    fn api_update_game(&mut self, id: &str, body: UpdateGameBody) -> Result<FullGameState, Error> {
        if id == self.tree.game().id {
            apply_game_update(self.tree.game_mut(), body);
            self.store.put_game(self.tree.game())?;
            self.broadcast_state();
            return Ok(self.tree.full_state());
        }
        let (game, nodes) = self.store.get_game_with_tree(id)?;
        let mut tree = GameTree::from_parts(game, nodes)?;
        apply_game_update(tree.game_mut(), body);
        self.store.put_game(tree.game())?;
        Ok(tree.full_state())
    }

    fn api_delete_game(&mut self, id: &str) -> Result<(), Error> {
        if id == self.tree.game().id {
            return Err(Error::BadRequest(
                "cannot delete the game currently open".to_string(),
            ));
        }
        self.store.delete_game(id)?;
        Ok(())
    }

    fn api_import(&mut self, text: &str) -> Result<ImportOutcome, Error> {
        let format = codec::detect(text).ok_or(Error::UnsupportedFormat)?;
        let parsed = self.codecs.parse(format, text)?;
        self.store.put_game(parsed.tree.game())?;
        for node in parsed.tree.nodes_ordered() {
            self.store.upsert_node(node)?;
        }
        info!(
            "imported {} game {} ({} warnings)",
            format.as_str(),
            parsed.tree.game().id,
            parsed.warnings.len()
        );
        self.hub.broadcast(frame(
            "toast",
            ToastPayload {
                level: "info",
                message: format!("imported {} kifu", format.as_str()),
            },
        ));
        Ok(ImportOutcome {
            format,
            game_id: parsed.tree.game().id.clone(),
            warnings: parsed.warnings,
        })
    }

    fn api_export(
        &self,
        id: &str,
        format: Format,
        all_variations: bool,
    ) -> Result<String, Error> {
        let emit = |tree: &GameTree| {
            self.codecs
                .emit(format, tree, EmitOptions { all_variations })
                .map_err(Error::from)
        };
        if id == self.tree.game().id {
            return emit(&self.tree);
        }
        let (game, nodes) = self.store.get_game_with_tree(id)?;
        let tree = GameTree::from_parts(game, nodes)?;
        emit(&tree)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn notify_node_changed(&mut self) {
        let node_id = self.tree.game().current_node_id.clone();
        match self.tree.position_command(&node_id) {
            Ok(position_command) => {
                self.analysis.node_changed(node_id, position_command).await;
            }
            Err(e) => error!("position command for cursor failed: {e}"),
        }
    }

    fn broadcast_state(&self) {
        self.hub.broadcast(frame("game:state", self.tree.full_state()));
    }

    fn toast(&self, conn_id: u64, level: &'static str, message: String) {
        self.hub
            .send_to(conn_id, frame("toast", ToastPayload { level, message }));
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            formats: self.codecs.supported_formats(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: serde_json::Value) -> Result<T, Error> {
    serde_json::from_value(payload).map_err(|e| Error::BadRequest(format!("bad payload: {e}")))
}

fn apply_game_update(game: &mut crate::tree::Game, body: UpdateGameBody) {
    if let Some(title) = body.title {
        game.title = title;
    }
    if let Some(meta) = body.meta {
        game.meta = meta;
    }
    game.updated_at = chrono::Utc::now();
}

//! HTTP + WebSocket surface.
//!
//! The axum router is thin: REST handlers marshal requests into
//! synchronizer intents and await the reply; the WebSocket handler runs one
//! reader and one writer task per connection. No state is mutated here.

pub mod hub;
pub mod protocol;

mod api;
mod ws;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::mpsc;

use crate::engine::StatusCell;
use crate::sync::Intent;
use hub::Hub;

/// Import body cap, bounding parse cost.
pub const IMPORT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppContext {
    pub hub: Hub,
    pub intents: mpsc::UnboundedSender<Intent>,
    pub engine_status: StatusCell,
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/api/games", get(api::list_games).post(api::create_game))
        .route(
            "/api/games/:id",
            get(api::get_game)
                .put(api::update_game)
                .delete(api::delete_game),
        )
        .route("/api/import", post(api::import_game))
        .route("/api/export/:id", get(api::export_game))
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(IMPORT_BODY_LIMIT))
        .with_state(ctx)
}

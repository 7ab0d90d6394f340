//! REST handlers. Each one marshals into a synchronizer intent and awaits
//! the oneshot reply; errors map to HTTP via `crate::error::Error`.

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tokio::sync::oneshot;

use super::protocol::{HealthResponse, ImportBody, UpdateGameBody};
use super::{AppContext, IMPORT_BODY_LIMIT};
use crate::codec::Format;
use crate::error::{Error, Result};
use crate::sync::{ApiRequest, Intent};

const MAX_PAGE_LIMIT: u32 = 100;
const DEFAULT_PAGE_LIMIT: u32 = 50;

async fn call<T, F>(ctx: &AppContext, build: F) -> Result<T>
where
    F: FnOnce(oneshot::Sender<Result<T>>) -> ApiRequest,
{
    let (reply, rx) = oneshot::channel();
    ctx.intents
        .send(Intent::Api(build(reply)))
        .map_err(|_| Error::Unavailable)?;
    rx.await.map_err(|_| Error::Unavailable)?
}

pub async fn healthz(State(ctx): State<AppContext>) -> impl IntoResponse {
    let engine_ok = ctx.engine_status.snapshot().is_reachable();
    Json(HealthResponse {
        status: "ok",
        engine_ok,
    })
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    limit: Option<u32>,
    offset: Option<u32>,
}

pub async fn list_games(
    State(ctx): State<AppContext>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse> {
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(Error::BadRequest(format!(
            "limit must be between 1 and {MAX_PAGE_LIMIT}"
        )));
    }
    let offset = params.offset.unwrap_or(0);
    let page = call(&ctx, |reply| ApiRequest::ListGames {
        limit,
        offset,
        reply,
    })
    .await?;
    Ok(Json(page))
}

pub async fn create_game(State(ctx): State<AppContext>) -> Result<impl IntoResponse> {
    let state = call(&ctx, |reply| ApiRequest::CreateGame { reply }).await?;
    Ok(Json(state))
}

pub async fn get_game(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let state = call(&ctx, |reply| ApiRequest::GetGame { id, reply }).await?;
    Ok(Json(state))
}

pub async fn update_game(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateGameBody>,
) -> Result<impl IntoResponse> {
    let state = call(&ctx, |reply| ApiRequest::UpdateGame { id, body, reply }).await?;
    Ok(Json(state))
}

pub async fn delete_game(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    call(&ctx, |reply| ApiRequest::DeleteGame { id, reply }).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub async fn import_game(
    State(ctx): State<AppContext>,
    Json(body): Json<ImportBody>,
) -> Result<impl IntoResponse> {
    if body.text.len() > IMPORT_BODY_LIMIT {
        return Err(Error::TooLarge);
    }
    let outcome = call(&ctx, |reply| ApiRequest::Import {
        text: body.text,
        reply,
    })
    .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    format: Option<String>,
    #[serde(default)]
    all_variations: bool,
}

pub async fn export_game(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Query(params): Query<ExportParams>,
) -> Result<impl IntoResponse> {
    let tag = params
        .format
        .ok_or_else(|| Error::BadRequest("missing format parameter".to_string()))?;
    let format =
        Format::from_tag(&tag).ok_or_else(|| Error::BadRequest(format!("unknown format '{tag}'")))?;
    let text = call(&ctx, |reply| ApiRequest::Export {
        id: id.clone(),
        format,
        all_variations: params.all_variations,
        reply,
    })
    .await?;
    let disposition = format!("attachment; filename=\"{id}.{}\"", format.as_str());
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        text,
    ))
}

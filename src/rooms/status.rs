//! Read-only room views served over HTTP.

use axum::{
    Json, debug_handler,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    AppError, AppResult,
    db::{Participant, RoomSummary, Store},
};

use super::channel::Signaling;

pub const DEFAULT_ROOM_LIMIT: i64 = 10;
pub const MAX_ROOM_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStatus {
    pub room_id: String,
    pub room_name: String,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: String,
    pub active_participants_count: i64,
    pub participants: Vec<Participant>,
    /// Channels currently bound to the room on this instance.
    pub connected_peers: usize,
}

pub async fn room_status(store: &Store, signaling: &Signaling, room_id: &str) -> AppResult<RoomStatus> {
    let Some(details) = store.find_room_details(room_id).await? else {
        return Err(AppError::NotFound("Room not found".to_owned()));
    };
    let participants = store.list_active_participants(room_id).await?;
    let count = store.count_active_participants(room_id).await?;

    Ok(RoomStatus {
        room_id: details.id,
        room_name: details.name,
        is_active: details.is_active,
        created_by: details.creator_name,
        created_at: details.created_at,
        active_participants_count: count,
        participants,
        connected_peers: signaling.registry().peer_count(room_id).await,
    })
}

pub async fn list_active_rooms(store: &Store, limit: Option<i64>) -> AppResult<Vec<RoomSummary>> {
    let limit = limit.unwrap_or(DEFAULT_ROOM_LIMIT).clamp(1, MAX_ROOM_LIMIT);
    Ok(store.list_recent_active_rooms(limit).await?)
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn rooms(
    State(store): State<Store>,
    Query(ListQuery { limit }): Query<ListQuery>,
) -> AppResult<Json<Vec<RoomSummary>>> {
    Ok(Json(list_active_rooms(&store, limit).await?))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn participants(
    State(store): State<Store>,
    Path(room_id): Path<String>,
) -> AppResult<Json<Vec<Participant>>> {
    Ok(Json(store.list_active_participants(&room_id).await?))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn participant_count(State(store): State<Store>, Path(room_id): Path<String>) -> AppResult<Json<Value>> {
    let count = store.count_active_participants(&room_id).await?;
    Ok(Json(json!({ "count": count })))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn status(
    State(store): State<Store>,
    State(signaling): State<Signaling>,
    Path(room_id): Path<String>,
) -> AppResult<Json<RoomStatus>> {
    Ok(Json(room_status(&store, &signaling, &room_id).await?))
}

use axum::{Json, debug_handler, extract::State, http::StatusCode};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use tracing::{info, warn};

use crate::{
    AppError, AppResult,
    db::Store,
    session::{self, SessionIdentity},
};

pub const ROOM_ID_LENGTH: usize = 8;
const ROOM_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const MAX_ROOM_ID_RETRIES: usize = 3;

#[derive(Debug, Deserialize)]
pub(crate) struct NewRoomQuery {
    #[serde(default)]
    username: String,
    #[serde(default)]
    room_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedRoom {
    pub room_id: String,
    pub room_name: String,
    pub user_id: i64,
    pub username: String,
}

pub fn generate_room_id() -> String {
    let mut rng = rand::rng();
    (0..ROOM_ID_LENGTH)
        .filter_map(|_| ROOM_ID_ALPHABET.choose(&mut rng).copied())
        .map(char::from)
        .collect()
}

/// Register `username` (if new) and open a fresh room created by them.
/// The creator does not become a participant until their channel joins.
pub async fn create_room(store: &Store, username: &str, room_name: &str) -> AppResult<CreatedRoom> {
    let username = username.trim();
    let room_name = room_name.trim();
    if username.is_empty() || room_name.is_empty() {
        return Err(AppError::Validation("Username and room name are required".to_owned()));
    }

    let user_id = store.get_or_create_user(username).await?;

    for _ in 0..MAX_ROOM_ID_RETRIES {
        let room_id = generate_room_id();
        match store.create_room(&room_id, room_name, user_id).await {
            Ok(()) => {
                info!(%room_id, user_id, "room created");
                return Ok(CreatedRoom {
                    room_id,
                    room_name: room_name.to_owned(),
                    user_id,
                    username: username.to_owned(),
                });
            }
            Err(err) if err.is_unique_violation() => {
                warn!(%room_id, "room id collision, retrying");
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(AppError::Internal("could not allocate a unique room id".to_owned()))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn new_room(
    State(store): State<Store>,
    session: Session,

    Json(NewRoomQuery { username, room_name }): Json<NewRoomQuery>,
) -> AppResult<(StatusCode, Json<CreatedRoom>)> {
    let created = create_room(&store, &username, &room_name).await?;

    let identity = SessionIdentity {
        user_id: created.user_id,
        username: created.username.clone(),
    };
    session::remember(&session, &identity, &created.room_id, &created.room_name).await?;

    Ok((StatusCode::CREATED, Json(created)))
}

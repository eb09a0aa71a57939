pub mod channel;
pub mod join;
pub mod msg;
pub mod new;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod status;
mod ws;

use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/create", post(new::new_room))
        .route("/join", post(join::join_room))
        .route("/ws", get(ws::room_ws))
        .route("/api/rooms", get(status::rooms))
        .route("/api/rooms/{room_id}/participants", get(status::participants))
        .route("/api/rooms/{room_id}/participants/count", get(status::participant_count))
        .route("/api/rooms/{room_id}/status", get(status::status))
}

pub mod appresult;
pub mod config;
pub mod db;
pub mod rooms;
pub mod session;

use std::sync::Arc;

use axum::{Router, extract::FromRef};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::SameSite};

pub use appresult::{AppError, AppResult};

use crate::{config::Config, db::Store, rooms::{channel::Signaling, registry::Registry}};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Store,
    pub signaling: Signaling,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: Store, config: Config) -> Self {
        let signaling = Signaling::new(store.clone(), Registry::new(), config.peer_channel_buffer);
        Self {
            store,
            signaling,
            config: Arc::new(config),
        }
    }
}

/// The full HTTP + WebSocket surface, with session, CORS and tracing layers.
pub fn app(state: AppState) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(
            state.config.session_expiry_minutes,
        )));

    Router::new()
        .merge(rooms::router())
        .with_state(state)
        .layer(session_layer)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

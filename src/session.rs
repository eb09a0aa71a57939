//! Keys for values kept in the HTTP session between `/create`/`/join`
//! and the channel upgrade.

use serde::{Deserialize, Serialize};
use tower_sessions::Session;

use crate::AppResult;

pub const USERNAME: &str = "username";
pub const USER_ID: &str = "user_id";
pub const ROOM_ID: &str = "room_id";
pub const ROOM_NAME: &str = "room_name";

/// Identity remembered from the last create/join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub user_id: i64,
    pub username: String,
}

pub async fn remember(session: &Session, identity: &SessionIdentity, room_id: &str, room_name: &str) -> AppResult<()> {
    session.insert(USERNAME, &identity.username).await?;
    session.insert(USER_ID, identity.user_id).await?;
    session.insert(ROOM_ID, room_id).await?;
    session.insert(ROOM_NAME, room_name).await?;
    Ok(())
}

pub async fn identity(session: &Session) -> AppResult<Option<SessionIdentity>> {
    let username = session.get::<String>(USERNAME).await?;
    let user_id = session.get::<i64>(USER_ID).await?;
    Ok(match (username, user_id) {
        (Some(username), Some(user_id)) => Some(SessionIdentity { user_id, username }),
        _ => None,
    })
}

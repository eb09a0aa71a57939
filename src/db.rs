//! Durable store: users, rooms and participation intervals in SQLite.
//!
//! This is the only state that survives a restart. Live channel handles
//! live in [`crate::rooms::registry`] and are never written here.

use std::{str::FromStr, time::Duration};

use serde::Serialize;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::Sqlx(err) => err
                .as_database_error()
                .is_some_and(|db_err| db_err.is_unique_violation()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub created_by: i64,
    pub created_at: String,
    pub is_active: bool,
}

/// A currently open participation, joined with the user's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Participant {
    pub user_id: i64,
    pub username: String,
    pub joined_at: String,
}

/// Row of the active-rooms listing.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RoomSummary {
    pub id: String,
    pub name: String,
    pub creator: String,
    pub created_at: String,
    pub participant_count: i64,
}

/// Room details with the creator's display name resolved.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RoomDetails {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub creator_name: String,
    pub created_at: String,
}

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT UNIQUE NOT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
    )"#,
    r#"CREATE TABLE IF NOT EXISTS rooms (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        created_by INTEGER NOT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
        is_active BOOLEAN NOT NULL DEFAULT 1,
        FOREIGN KEY (created_by) REFERENCES users (id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS room_participants (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        room_id TEXT NOT NULL,
        user_id INTEGER NOT NULL,
        joined_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
        left_at TEXT,
        FOREIGN KEY (room_id) REFERENCES rooms (id),
        FOREIGN KEY (user_id) REFERENCES users (id)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_room_participants_open
        ON room_participants (room_id, user_id, left_at)"#,
];

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool against `url`, creating the database file if needed.
    pub async fn connect(url: &str, max_connections: u32, busy_timeout: Duration) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(busy_timeout * 2)
            .connect_with(options)
            .await?;

        Ok(Self::new(pool))
    }

    /// Single-connection in-memory store. The connection is never recycled,
    /// so the database lives as long as the pool.
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Close every participation still open. Run at startup: no channel
    /// from a previous process can still be connected.
    #[instrument(skip_all)]
    pub async fn close_orphaned_participations(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE room_participants SET left_at = strftime('%Y-%m-%d %H:%M:%f', 'now') WHERE left_at IS NULL",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    pub async fn get_or_create_user(&self, username: &str) -> StoreResult<i64> {
        sqlx::query("INSERT INTO users (username) VALUES (?) ON CONFLICT (username) DO NOTHING")
            .bind(username)
            .execute(&self.pool)
            .await?;

        let (id,): (i64,) = sqlx::query_as("SELECT id FROM users WHERE username = ?")
            .bind(username)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn find_user(&self, user_id: i64) -> StoreResult<Option<User>> {
        Ok(sqlx::query_as("SELECT id, username, created_at FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    #[instrument(skip(self))]
    pub async fn create_room(&self, room_id: &str, name: &str, creator_id: i64) -> StoreResult<()> {
        sqlx::query("INSERT INTO rooms (id, name, created_by) VALUES (?, ?, ?)")
            .bind(room_id)
            .bind(name)
            .bind(creator_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn find_active_room(&self, room_id: &str) -> StoreResult<Option<Room>> {
        Ok(sqlx::query_as(
            "SELECT id, name, created_by, created_at, is_active FROM rooms WHERE id = ? AND is_active = 1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Look up a room regardless of its active flag.
    pub async fn find_room_details(&self, room_id: &str) -> StoreResult<Option<RoomDetails>> {
        Ok(sqlx::query_as(
            r#"SELECT r.id, r.name, r.is_active, u.username AS creator_name, r.created_at
            FROM rooms r
            JOIN users u ON r.created_by = u.id
            WHERE r.id = ?"#,
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Id of the open participation for `(room_id, user_id)`, if any.
    pub async fn open_participation_id(&self, room_id: &str, user_id: i64) -> StoreResult<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM room_participants WHERE room_id = ? AND user_id = ? AND left_at IS NULL",
        )
        .bind(room_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Insert an open participation. Callers check [`Store::open_participation_id`]
    /// first while holding the room lock.
    #[instrument(skip(self))]
    pub async fn open_participation(&self, room_id: &str, user_id: i64) -> StoreResult<i64> {
        let result = sqlx::query("INSERT INTO room_participants (room_id, user_id) VALUES (?, ?)")
            .bind(room_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Stamp `left_at` on the most recent open row. Returns whether a row
    /// was closed; closing with nothing open is not an error.
    #[instrument(skip(self))]
    pub async fn close_participation(&self, room_id: &str, user_id: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"UPDATE room_participants
            SET left_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
            WHERE id = (
                SELECT id FROM room_participants
                WHERE room_id = ? AND user_id = ? AND left_at IS NULL
                ORDER BY id DESC
                LIMIT 1
            )"#,
        )
        .bind(room_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(room_id, user_id, "no open participation to close");
        }
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_active_participants(&self, room_id: &str) -> StoreResult<Vec<Participant>> {
        Ok(sqlx::query_as(
            r#"SELECT rp.user_id, u.username, rp.joined_at
            FROM room_participants rp
            JOIN users u ON rp.user_id = u.id
            WHERE rp.room_id = ? AND rp.left_at IS NULL
            ORDER BY rp.joined_at, rp.id"#,
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn count_active_participants(&self, room_id: &str) -> StoreResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM room_participants WHERE room_id = ? AND left_at IS NULL",
        )
        .bind(room_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn list_recent_active_rooms(&self, limit: i64) -> StoreResult<Vec<RoomSummary>> {
        Ok(sqlx::query_as(
            r#"SELECT r.id, r.name, u.username AS creator, r.created_at,
                (SELECT COUNT(*) FROM room_participants
                 WHERE room_id = r.id AND left_at IS NULL) AS participant_count
            FROM rooms r
            JOIN users u ON r.created_by = u.id
            WHERE r.is_active = 1
            ORDER BY r.created_at DESC, r.rowid DESC
            LIMIT ?"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }
}

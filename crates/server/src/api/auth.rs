use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::api::{internal_error, message, ApiError, AppState, CurrentUser, MessageResponse};

/// A user as exposed over the wire — never carries password material.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeUser {
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
    pub total_predictions: u32,
    pub accurate_predictions: u32,
    pub accuracy_percentage: String,
    pub is_verified_advisor: bool,
    pub current_badge: Option<String>,
    pub created_at: String,
}

/// Column list matching [`safe_user_from_row`]. Keep the two in sync.
pub const SAFE_USER_COLUMNS: &str = "id, username, is_admin, total_predictions, \
     accurate_predictions, accuracy_percentage, is_verified_advisor, current_badge, created_at";

pub fn safe_user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SafeUser> {
    Ok(SafeUser {
        id: row.get(0)?,
        username: row.get(1)?,
        is_admin: row.get(2)?,
        total_predictions: row.get(3)?,
        accurate_predictions: row.get(4)?,
        accuracy_percentage: row.get(5)?,
        is_verified_advisor: row.get(6)?,
        current_badge: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// Salted SHA-256, stored as `{hash_hex}.{salt_hex}`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill(&mut salt);
    let salt = hex::encode(salt);
    let digest = Sha256::new()
        .chain_update(salt.as_bytes())
        .chain_update(password.as_bytes())
        .finalize();
    format!("{}.{salt}", hex::encode(digest))
}

pub fn verify_password(supplied: &str, stored: &str) -> bool {
    let Some((hash, salt)) = stored.split_once('.') else {
        return false;
    };
    let digest = Sha256::new()
        .chain_update(salt.as_bytes())
        .chain_update(supplied.as_bytes())
        .finalize();
    constant_time_eq(hex::encode(digest).as_bytes(), hash.as_bytes())
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn new_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

#[derive(Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub user: SafeUser,
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CredentialsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.trim().to_string();
    if username.len() < 3 || username.len() > 40 {
        return Err(message(
            StatusCode::BAD_REQUEST,
            "Username must be 3-40 characters",
        ));
    }
    if req.password.len() < 8 {
        return Err(message(
            StatusCode::BAD_REQUEST,
            "Password must be at least 8 characters",
        ));
    }

    let password_hash = hash_password(&req.password);
    let token = new_session_token();
    let ttl = state.server.session_ttl_hours;

    let created = state
        .db
        .call_named("register", {
            let (username, token) = (username.clone(), token.clone());
            move |conn| {
                use rusqlite::OptionalExtension;
                let exists: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM users WHERE username = ?1",
                        [&username],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_some() {
                    return Ok(None);
                }
                conn.execute(
                    "INSERT INTO users (username, password_hash) VALUES (?1, ?2)",
                    rusqlite::params![username, password_hash],
                )?;
                let user_id = conn.last_insert_rowid();
                conn.execute(
                    "INSERT INTO sessions (token, user_id, expires_at)
                     VALUES (?1, ?2, datetime('now', ?3))",
                    rusqlite::params![token, user_id, format!("+{ttl} hours")],
                )?;
                let user = conn.query_row(
                    &format!("SELECT {SAFE_USER_COLUMNS} FROM users WHERE id = ?1"),
                    [user_id],
                    safe_user_from_row,
                )?;
                Ok(Some(user))
            }
        })
        .await
        .map_err(|err| internal_error("register", &err))?;

    let Some(user) = created else {
        return Err(message(StatusCode::BAD_REQUEST, "Username already exists"));
    };

    tracing::info!(username = %user.username, "user registered");
    Ok((StatusCode::CREATED, Json(SessionResponse { token, user })))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let token = new_session_token();
    let ttl = state.server.session_ttl_hours;
    let username = req.username.trim().to_string();

    let found = state
        .db
        .call_named("login", {
            let (username, token) = (username.clone(), token.clone());
            move |conn| {
                use rusqlite::OptionalExtension;
                // Opportunistic cleanup keeps the table from growing with
                // dead tokens.
                conn.execute(
                    "DELETE FROM sessions WHERE expires_at <= datetime('now')",
                    [],
                )?;
                let row: Option<(i64, String)> = conn
                    .query_row(
                        "SELECT id, password_hash FROM users WHERE username = ?1",
                        [&username],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((user_id, stored)) = row else {
                    return Ok(None);
                };
                if !verify_password(&req.password, &stored) {
                    return Ok(None);
                }
                conn.execute(
                    "INSERT INTO sessions (token, user_id, expires_at)
                     VALUES (?1, ?2, datetime('now', ?3))",
                    rusqlite::params![token, user_id, format!("+{ttl} hours")],
                )?;
                let user = conn.query_row(
                    &format!("SELECT {SAFE_USER_COLUMNS} FROM users WHERE id = ?1"),
                    [user_id],
                    safe_user_from_row,
                )?;
                Ok(Some(user))
            }
        })
        .await
        .map_err(|err| internal_error("login", &err))?;

    let Some(user) = found else {
        return Err(message(StatusCode::UNAUTHORIZED, "Invalid credentials"));
    };
    Ok(Json(SessionResponse { token, user }))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    _user: CurrentUser,
    headers: HeaderMap,
) -> Result<Json<MessageResponse>, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| message(StatusCode::UNAUTHORIZED, "Not authenticated"))?;

    state
        .db
        .call_named("logout", move |conn| {
            conn.execute("DELETE FROM sessions WHERE token = ?1", [token])?;
            Ok(())
        })
        .await
        .map_err(|err| internal_error("logout", &err))?;

    Ok(Json(MessageResponse {
        message: "Logged out".to_string(),
    }))
}

pub async fn current_user(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
) -> Result<Json<SafeUser>, ApiError> {
    let user_id = user.id;
    let user = state
        .db
        .call_named("current_user", move |conn| {
            Ok(conn.query_row(
                &format!("SELECT {SAFE_USER_COLUMNS} FROM users WHERE id = ?1"),
                [user_id],
                safe_user_from_row,
            )?)
        })
        .await
        .map_err(|err| internal_error("current_user", &err))?;
    Ok(Json(user))
}

pub mod admin;
pub mod assets;
pub mod auth;
pub mod users;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use common::config::{Badges, Server, Verification};
use common::db::AsyncDb;

/// Shared application state available to all handlers.
pub struct AppState {
    pub db: AsyncDb,
    pub server: Server,
    pub badges: Badges,
    pub verification: Verification,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

pub type ApiError = (StatusCode, Json<MessageResponse>);

pub fn message(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(MessageResponse {
            message: message.into(),
        }),
    )
}

/// 500 with a generic body; the real error only goes to the server log.
pub fn internal_error(context: &'static str, err: &anyhow::Error) -> ApiError {
    tracing::error!(context, error = %err, "request failed");
    message(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

/// The authenticated user behind a bearer session token.
///
/// Extracting this rejects with 401 when the Authorization header is
/// missing, malformed, unknown, or expired. Admin rights are an explicit
/// role claim on the user row, exposed through [`Self::can_administer`]
/// rather than username comparisons in handlers.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
}

impl CurrentUser {
    pub fn can_administer(&self) -> bool {
        self.is_admin
    }
}

impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
            .ok_or_else(|| message(StatusCode::UNAUTHORIZED, "Not authenticated"))?;

        let user = state
            .db
            .call_named("session_lookup", move |conn| {
                use rusqlite::OptionalExtension;
                let row = conn
                    .query_row(
                        "SELECT u.id, u.username, u.is_admin
                         FROM sessions s JOIN users u ON u.id = s.user_id
                         WHERE s.token = ?1 AND s.expires_at > datetime('now')",
                        [token],
                        |row| {
                            Ok(CurrentUser {
                                id: row.get(0)?,
                                username: row.get(1)?,
                                is_admin: row.get(2)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(|err| internal_error("session_lookup", &err))?;

        user.ok_or_else(|| message(StatusCode::UNAUTHORIZED, "Not authenticated"))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/register", post(auth::register))
        .route("/api/login", post(auth::login))
        .route("/api/logout", post(auth::logout))
        .route("/api/user", get(auth::current_user))
        .route("/api/assets", get(assets::list_assets))
        .route("/api/assets/{symbol}", get(assets::get_asset))
        .route(
            "/api/assets/{symbol}/opinions",
            get(assets::list_opinions).post(assets::create_opinion),
        )
        .route("/api/users/{user_id}/badge", get(users::current_badge))
        .route("/api/users/{user_id}/badges", get(users::badge_history))
        .route(
            "/api/verification-progress",
            get(users::verification_progress),
        )
        .route("/api/top-predictors/{month_year}", get(users::top_predictors))
        .route("/api/admin/assign-badges", post(admin::assign_badges))
        .route("/api/admin/users", get(admin::list_users))
        .route("/api/admin/assets", post(admin::create_asset))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
}

async fn health(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: uptime,
    })
}

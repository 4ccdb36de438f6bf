use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::{internal_error, message, ApiError, AppState, CurrentUser};
use crate::rankings::{self, TopPredictor};
use crate::verification::{self, VerificationProgress};
use common::types::MonthYear;

fn parse_user_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse()
        .map_err(|_| message(StatusCode::BAD_REQUEST, "User id must be numeric"))
}

async fn require_user(state: &Arc<AppState>, user_id: i64) -> Result<(), ApiError> {
    let exists = state
        .db
        .call_named("require_user", move |conn| {
            use rusqlite::OptionalExtension;
            Ok(conn
                .query_row("SELECT 1 FROM users WHERE id = ?1", [user_id], |_| Ok(()))
                .optional()?
                .is_some())
        })
        .await
        .map_err(|err| internal_error("require_user", &err))?;
    if exists {
        Ok(())
    } else {
        Err(message(StatusCode::NOT_FOUND, "User not found"))
    }
}

/// The body is the badge string itself, or `null` when the user holds none.
pub async fn current_badge(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Option<String>>, ApiError> {
    let user_id = parse_user_id(&user_id)?;
    let badge = state
        .db
        .call_named("current_badge", move |conn| {
            use rusqlite::OptionalExtension;
            Ok(conn
                .query_row(
                    "SELECT current_badge FROM users WHERE id = ?1",
                    [user_id],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()?)
        })
        .await
        .map_err(|err| internal_error("current_badge", &err))?;
    match badge {
        Some(current_badge) => Ok(Json(current_badge)),
        None => Err(message(StatusCode::NOT_FOUND, "User not found")),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeResponse {
    pub id: i64,
    pub user_id: i64,
    pub username: String,
    pub badge_type: String,
    pub month_year: String,
    pub accuracy_percentage: String,
    pub total_predictions: u32,
    pub created_at: String,
}

pub async fn badge_history(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<BadgeResponse>>, ApiError> {
    let user_id = parse_user_id(&user_id)?;
    require_user(&state, user_id).await?;

    let badges = state
        .db
        .call_named("badge_history", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, username, badge_type, month_year,
                        accuracy_percentage, total_predictions, created_at
                 FROM user_badges
                 WHERE user_id = ?1
                 ORDER BY month_year DESC",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(BadgeResponse {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        username: row.get(2)?,
                        badge_type: row.get(3)?,
                        month_year: row.get(4)?,
                        accuracy_percentage: row.get(5)?,
                        total_predictions: row.get(6)?,
                        created_at: row.get(7)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(|err| internal_error("badge_history", &err))?;
    Ok(Json(badges))
}

pub async fn verification_progress(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
) -> Result<Json<VerificationProgress>, ApiError> {
    let progress = verification::refresh_user(&state.db, user.id, state.verification)
        .await
        .map_err(|err| internal_error("verification_progress", &err))?
        .ok_or_else(|| message(StatusCode::NOT_FOUND, "User not found"))?;
    Ok(Json(progress))
}

#[derive(Deserialize)]
pub struct TopPredictorsQuery {
    pub limit: Option<u32>,
}

pub async fn top_predictors(
    State(state): State<Arc<AppState>>,
    Path(month_year): Path<String>,
    Query(query): Query<TopPredictorsQuery>,
) -> Result<Json<Vec<TopPredictor>>, ApiError> {
    let month: MonthYear = month_year
        .parse()
        .map_err(|_| message(StatusCode::BAD_REQUEST, "Month must be formatted YYYY-MM"))?;
    let limit = query.limit.unwrap_or(5).clamp(1, 100);

    let top = state
        .db
        .call_named("top_predictors", move |conn| {
            rankings::top_predictors(conn, month, limit)
        })
        .await
        .map_err(|err| internal_error("top_predictors", &err))?;
    Ok(Json(top))
}

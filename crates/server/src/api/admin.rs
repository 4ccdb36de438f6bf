use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::assets::AssetResponse;
use crate::api::auth::{safe_user_from_row, SafeUser, SAFE_USER_COLUMNS};
use crate::api::{internal_error, message, ApiError, AppState, CurrentUser, MessageResponse};
use crate::rankings;
use common::types::{AssetKind, MonthYear};

fn require_admin(user: &CurrentUser) -> Result<(), ApiError> {
    if user.can_administer() {
        Ok(())
    } else {
        Err(message(StatusCode::FORBIDDEN, "Admin access required"))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignBadgesRequest {
    pub month_year: String,
}

pub async fn assign_badges(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Json(req): Json<AssignBadgesRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    require_admin(&user)?;

    let month: MonthYear = req
        .month_year
        .parse()
        .map_err(|_| message(StatusCode::BAD_REQUEST, "Month must be formatted YYYY-MM"))?;

    let summary = rankings::run_for_month(&state.db, month, state.badges.min_monthly_predictions)
        .await
        .map_err(|err| internal_error("assign_badges", &err))?;

    tracing::info!(
        %month,
        ranked = summary.ranked,
        awarded = summary.awarded,
        admin = %user.username,
        "manual badge run"
    );
    Ok(Json(MessageResponse {
        message: format!("Badges assigned for {month}"),
    }))
}

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
) -> Result<Json<Vec<SafeUser>>, ApiError> {
    require_admin(&user)?;

    let users = state
        .db
        .call_named("list_users", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SAFE_USER_COLUMNS} FROM users ORDER BY id ASC"
            ))?;
            let rows = stmt
                .query_map([], safe_user_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(|err| internal_error("list_users", &err))?;
    Ok(Json(users))
}

#[derive(Deserialize)]
pub struct CreateAssetRequest {
    pub symbol: String,
    pub name: String,
    // Clients send this as "type"; keyword-safe name here.
    #[serde(alias = "type")]
    pub category: String,
}

pub async fn create_asset(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Json(req): Json<CreateAssetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&user)?;

    let symbol = req.symbol.trim().to_uppercase();
    if symbol.is_empty() || symbol.len() > 10 {
        return Err(message(
            StatusCode::BAD_REQUEST,
            "Symbol must be 1-10 characters",
        ));
    }
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(message(StatusCode::BAD_REQUEST, "Name is required"));
    }
    let Some(kind) = AssetKind::from_str_loose(&req.category) else {
        return Err(message(
            StatusCode::BAD_REQUEST,
            "Category must be stock or crypto",
        ));
    };

    let created = state
        .db
        .call_named("create_asset", move |conn| {
            use rusqlite::OptionalExtension;
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM assets WHERE symbol = ?1",
                    [&symbol],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Ok(None);
            }
            conn.execute(
                "INSERT INTO assets (symbol, name, category) VALUES (?1, ?2, ?3)",
                rusqlite::params![symbol, name, kind.as_str()],
            )?;
            let asset = conn.query_row(
                "SELECT id, symbol, name, category, sentiment, prediction
                 FROM assets WHERE id = ?1",
                [conn.last_insert_rowid()],
                |row| {
                    Ok(AssetResponse {
                        id: row.get(0)?,
                        symbol: row.get(1)?,
                        name: row.get(2)?,
                        category: row.get(3)?,
                        sentiment: row.get(4)?,
                        prediction: row.get(5)?,
                    })
                },
            )?;
            Ok(Some(asset))
        })
        .await
        .map_err(|err| internal_error("create_asset", &err))?;

    let Some(asset) = created else {
        return Err(message(StatusCode::BAD_REQUEST, "Symbol already exists"));
    };
    Ok((StatusCode::CREATED, Json(asset)))
}

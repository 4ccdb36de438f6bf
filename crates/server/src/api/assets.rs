use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::{internal_error, message, ApiError, AppState, CurrentUser};
use crate::{sentiment, verification};
use common::types::Sentiment;

pub const COMMENT_MAX_LEN: usize = 500;
pub const PREDICTION_MIN: f64 = -100.0;
pub const PREDICTION_MAX: f64 = 1000.0;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetResponse {
    pub id: i64,
    pub symbol: String,
    pub name: String,
    pub category: String,
    pub sentiment: String,
    pub prediction: String,
}

fn asset_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssetResponse> {
    Ok(AssetResponse {
        id: row.get(0)?,
        symbol: row.get(1)?,
        name: row.get(2)?,
        category: row.get(3)?,
        sentiment: row.get(4)?,
        prediction: row.get(5)?,
    })
}

const ASSET_COLUMNS: &str = "id, symbol, name, category, sentiment, prediction";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpinionResponse {
    pub id: i64,
    pub user_id: i64,
    pub asset_id: i64,
    pub username: String,
    pub sentiment: String,
    pub prediction: String,
    pub comment: Option<String>,
    pub created_at: String,
}

fn opinion_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OpinionResponse> {
    Ok(OpinionResponse {
        id: row.get(0)?,
        user_id: row.get(1)?,
        asset_id: row.get(2)?,
        username: row.get(3)?,
        sentiment: row.get(4)?,
        prediction: row.get(5)?,
        comment: row.get(6)?,
        created_at: row.get(7)?,
    })
}

const OPINION_COLUMNS: &str =
    "id, user_id, asset_id, username, sentiment, prediction, comment, created_at";

pub async fn list_assets(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<AssetResponse>>, ApiError> {
    let assets = state
        .db
        .call_named("list_assets", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ASSET_COLUMNS} FROM assets ORDER BY symbol ASC"
            ))?;
            let rows = stmt
                .query_map([], asset_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(|err| internal_error("list_assets", &err))?;
    Ok(Json(assets))
}

pub async fn get_asset(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Json<AssetResponse>, ApiError> {
    let asset = lookup_asset(&state, symbol).await?;
    Ok(Json(asset))
}

pub async fn list_opinions(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Json<Vec<OpinionResponse>>, ApiError> {
    let asset = lookup_asset(&state, symbol).await?;
    let opinions = state
        .db
        .call_named("list_opinions", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OPINION_COLUMNS} FROM opinions WHERE asset_id = ?1 ORDER BY id DESC"
            ))?;
            let rows = stmt
                .query_map([asset.id], opinion_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(|err| internal_error("list_opinions", &err))?;
    Ok(Json(opinions))
}

#[derive(Deserialize)]
pub struct CreateOpinionRequest {
    pub sentiment: String,
    pub prediction: f64,
    pub comment: Option<String>,
}

pub async fn create_opinion(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path(symbol): Path<String>,
    Json(req): Json<CreateOpinionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let asset = lookup_asset(&state, symbol).await?;

    let Some(sentiment) = Sentiment::from_str_loose(&req.sentiment) else {
        return Err(message(
            StatusCode::BAD_REQUEST,
            "Sentiment must be positive, neutral or negative",
        ));
    };
    if !req.prediction.is_finite()
        || req.prediction < PREDICTION_MIN
        || req.prediction > PREDICTION_MAX
    {
        return Err(message(
            StatusCode::BAD_REQUEST,
            "Prediction must be between -100 and 1000",
        ));
    }
    if let Some(comment) = &req.comment {
        if comment.chars().count() > COMMENT_MAX_LEN {
            return Err(message(
                StatusCode::BAD_REQUEST,
                "Comment must be 500 characters or fewer",
            ));
        }
    }
    let prediction = Decimal::try_from(req.prediction)
        .map_err(|_| {
            message(
                StatusCode::BAD_REQUEST,
                "Prediction must be between -100 and 1000",
            )
        })?
        .round_dp(2);

    let user_id = user.id;
    let username = user.username.clone();
    let asset_id = asset.id;
    let comment = req.comment.clone();

    // Opinion insert, the author's lifetime counter and the asset aggregate
    // move together or not at all.
    let opinion = state
        .db
        .call_named("create_opinion", move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO opinions (user_id, asset_id, username, sentiment, prediction, comment)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    user_id,
                    asset_id,
                    username,
                    sentiment.as_str(),
                    prediction.to_string(),
                    comment
                ],
            )?;
            let opinion_id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE users SET total_predictions = total_predictions + 1 WHERE id = ?1",
                [user_id],
            )?;
            sentiment::recompute_asset(&tx, asset_id)?;
            let opinion = tx.query_row(
                &format!("SELECT {OPINION_COLUMNS} FROM opinions WHERE id = ?1"),
                [opinion_id],
                opinion_from_row,
            )?;
            tx.commit()?;
            Ok(opinion)
        })
        .await
        .map_err(|err| internal_error("create_opinion", &err))?;

    metrics::counter!("pulse_opinions_submitted_total").increment(1);

    // Crossing the verification threshold is a side effect of submission, a
    // failure here must not roll back the accepted opinion.
    if let Err(err) = verification::refresh_user(&state.db, user.id, state.verification).await {
        tracing::warn!(user_id = user.id, error = %err, "verification refresh failed");
    }

    Ok((StatusCode::CREATED, Json(opinion)))
}

async fn lookup_asset(state: &Arc<AppState>, symbol: String) -> Result<AssetResponse, ApiError> {
    state
        .db
        .call_named("lookup_asset", move |conn| {
            use rusqlite::OptionalExtension;
            Ok(conn
                .query_row(
                    &format!("SELECT {ASSET_COLUMNS} FROM assets WHERE symbol = ?1"),
                    [&symbol],
                    asset_from_row,
                )
                .optional()?)
        })
        .await
        .map_err(|err| internal_error("lookup_asset", &err))?
        .ok_or_else(|| message(StatusCode::NOT_FOUND, "Asset not found"))
}

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDateTime, Utc};
use common::config::Verification;
use common::db::AsyncDb;
use rusqlite::OptionalExtension;
use serde::Serialize;

/// Progress toward "verified advisor" status, returned to the client even
/// when the user is not yet eligible.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationProgress {
    pub total_predictions: u32,
    pub required_predictions: u32,
    pub account_age_months: u32,
    pub required_age_months: u32,
    pub meets_age_requirement: bool,
    pub meets_predictions_requirement: bool,
    pub is_eligible: bool,
    pub is_verified_advisor: bool,
}

/// Whole months elapsed from `from` to `to`; the day-of-month must be
/// reached for a month to count. Never negative.
fn months_between(from: NaiveDateTime, to: NaiveDateTime) -> u32 {
    if to <= from {
        return 0;
    }
    let mut months =
        (to.year() - from.year()) * 12 + (to.month() as i32 - from.month() as i32);
    if (to.day(), to.time()) < (from.day(), from.time()) {
        months -= 1;
    }
    months.max(0) as u32
}

/// Evaluate both thresholds independently. A user already flagged as
/// verified stays verified regardless of the thresholds.
pub fn evaluate(
    created_at: NaiveDateTime,
    total_predictions: u32,
    already_verified: bool,
    now: NaiveDateTime,
    requirements: Verification,
) -> VerificationProgress {
    let account_age_months = months_between(created_at, now);
    let meets_age = account_age_months >= requirements.min_account_age_months;
    let meets_predictions = total_predictions >= requirements.min_predictions;
    let is_eligible = meets_age && meets_predictions;
    VerificationProgress {
        total_predictions,
        required_predictions: requirements.min_predictions,
        account_age_months,
        required_age_months: requirements.min_account_age_months,
        meets_age_requirement: meets_age,
        meets_predictions_requirement: meets_predictions,
        is_eligible,
        is_verified_advisor: already_verified || is_eligible,
    }
}

/// Re-evaluate a user's verification status and persist the advisor flag
/// when they cross into eligibility. Returns None for an unknown user.
pub async fn refresh_user(
    db: &AsyncDb,
    user_id: i64,
    requirements: Verification,
) -> Result<Option<VerificationProgress>> {
    let now = Utc::now().naive_utc();
    db.call_named("verification_refresh", move |conn| {
        let row: Option<(String, u32, bool)> = conn
            .query_row(
                "SELECT created_at, total_predictions, is_verified_advisor
                 FROM users WHERE id = ?1",
                [user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((created_at, total_predictions, already_verified)) = row else {
            return Ok(None);
        };

        let created_at = NaiveDateTime::parse_from_str(&created_at, "%Y-%m-%d %H:%M:%S")
            .with_context(|| format!("user {user_id}: bad created_at {created_at:?}"))?;
        let progress = evaluate(created_at, total_predictions, already_verified, now, requirements);

        if progress.is_eligible && !already_verified {
            conn.execute(
                "UPDATE users SET is_verified_advisor = 1 WHERE id = ?1",
                [user_id],
            )?;
            tracing::info!(user_id, "user promoted to verified advisor");
        }
        Ok(Some(progress))
    })
    .await
}

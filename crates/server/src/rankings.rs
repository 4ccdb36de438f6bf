use anyhow::Result;
use common::db::AsyncDb;
use common::types::{BadgeTier, MonthYear};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::Serialize;

/// One user's aggregated activity for a single month, in first-submission
/// order (the order the monthly query yields).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthlyStats {
    pub user_id: i64,
    pub username: String,
    pub predictions: u32,
    pub accurate: u32,
}

impl MonthlyStats {
    /// Accuracy percentage as an exact decimal, two places.
    pub fn accuracy(&self) -> Decimal {
        if self.predictions == 0 {
            return Decimal::new(0, 2);
        }
        let mut pct = (Decimal::from(self.accurate) * Decimal::from(100)
            / Decimal::from(self.predictions))
        .round_dp(2);
        // Fixed scale so stored strings compare and render consistently.
        pct.rescale(2);
        pct
    }
}

#[derive(Debug, Clone)]
pub struct RankedPredictor {
    pub rank: u32,
    pub accuracy: Decimal,
    pub badge: Option<BadgeTier>,
    pub stats: MonthlyStats,
}

/// Rank a month's qualifying users: accuracy descending, ties broken by
/// higher monthly prediction count. The sort is stable, so users tied on
/// both keys stay in first-submission order — no secondary key is defined
/// for that case.
pub fn rank_predictors(mut stats: Vec<MonthlyStats>) -> Vec<RankedPredictor> {
    stats.sort_by(|a, b| {
        b.accuracy()
            .cmp(&a.accuracy())
            .then(b.predictions.cmp(&a.predictions))
    });
    stats
        .into_iter()
        .enumerate()
        .map(|(i, stats)| {
            let rank = (i + 1) as u32;
            RankedPredictor {
                rank,
                accuracy: stats.accuracy(),
                badge: BadgeTier::for_rank(rank),
                stats,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct BadgeRunSummary {
    pub month: MonthYear,
    pub ranked: usize,
    pub awarded: usize,
}

/// Aggregate the month's per-user prediction and accuracy counts. A
/// prediction belongs to the month its opinion was created in; accuracy
/// comes from verified prediction_results rows joined to those opinions.
fn monthly_stats(conn: &Connection, month: MonthYear, min_predictions: u32) -> Result<Vec<MonthlyStats>> {
    let mut stmt = conn.prepare(
        "SELECT o.user_id, o.username,
                COUNT(DISTINCT o.id) AS predictions,
                COUNT(DISTINCT CASE WHEN pr.was_accurate = 1 THEN pr.opinion_id END) AS accurate
         FROM opinions o
         LEFT JOIN prediction_results pr ON pr.opinion_id = o.id
         WHERE substr(o.created_at, 1, 7) = ?1
         GROUP BY o.user_id
         HAVING COUNT(DISTINCT o.id) >= ?2
         ORDER BY MIN(o.id) ASC",
    )?;
    let rows = stmt
        .query_map(
            rusqlite::params![month.to_string(), min_predictions],
            |row| {
                Ok(MonthlyStats {
                    user_id: row.get(0)?,
                    username: row.get(1)?,
                    predictions: row.get(2)?,
                    accurate: row.get(3)?,
                })
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Run the monthly badge assignment for `month` inside one transaction.
///
/// Re-running for the same month is idempotent: the month's leaderboard
/// snapshot is replaced wholesale and badge rows are upserted on their
/// (user, month) key, so no duplicates can accumulate.
pub fn assign_monthly_badges(
    conn: &mut Connection,
    month: MonthYear,
    min_predictions: u32,
) -> Result<BadgeRunSummary> {
    let tx = conn.transaction()?;

    let ranked = rank_predictors(monthly_stats(&tx, month, min_predictions)?);

    // Full ranked list goes into the leaderboard snapshot, not just top 5.
    tx.execute(
        "DELETE FROM leaderboard_entries WHERE month_year = ?1",
        [month.to_string()],
    )?;
    for entry in &ranked {
        tx.execute(
            "INSERT INTO leaderboard_entries
                 (user_id, username, total_predictions, accurate_predictions,
                  accuracy_percentage, rank, month_year)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.stats.user_id,
                entry.stats.username,
                entry.stats.predictions,
                entry.stats.accurate,
                entry.accuracy.to_string(),
                entry.rank,
                month.to_string(),
            ],
        )?;
    }

    // current_badge is a projection of this run: cleared everywhere, set for
    // the five winners.
    tx.execute(
        "UPDATE users SET current_badge = NULL WHERE current_badge IS NOT NULL",
        [],
    )?;

    let mut awarded = 0usize;
    for entry in &ranked {
        let Some(badge) = entry.badge else { break };
        tx.execute(
            "INSERT INTO user_badges
                 (user_id, username, badge_type, month_year, accuracy_percentage, total_predictions)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id, month_year) DO UPDATE SET
                 badge_type = excluded.badge_type,
                 accuracy_percentage = excluded.accuracy_percentage,
                 total_predictions = excluded.total_predictions",
            rusqlite::params![
                entry.stats.user_id,
                entry.stats.username,
                badge.as_str(),
                month.to_string(),
                entry.accuracy.to_string(),
                entry.stats.predictions,
            ],
        )?;
        tx.execute(
            "UPDATE users SET current_badge = ?1 WHERE id = ?2",
            rusqlite::params![badge.as_str(), entry.stats.user_id],
        )?;
        awarded += 1;
    }

    // Refresh lifetime accuracy for everyone ranked this month, from all of
    // their verified results.
    for entry in &ranked {
        let (verified, accurate): (u32, u32) = tx.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN was_accurate = 1 THEN 1 ELSE 0 END), 0)
             FROM prediction_results WHERE user_id = ?1",
            [entry.stats.user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let lifetime = MonthlyStats {
            user_id: entry.stats.user_id,
            username: entry.stats.username.clone(),
            predictions: verified,
            accurate,
        };
        tx.execute(
            "UPDATE users SET accurate_predictions = ?1, accuracy_percentage = ?2 WHERE id = ?3",
            rusqlite::params![
                accurate,
                lifetime.accuracy().to_string(),
                entry.stats.user_id
            ],
        )?;
    }

    tx.commit()?;
    Ok(BadgeRunSummary {
        month,
        ranked: ranked.len(),
        awarded,
    })
}

/// Async entry point used by the scheduler and the admin endpoint.
pub async fn run_for_month(
    db: &AsyncDb,
    month: MonthYear,
    min_predictions: u32,
) -> Result<BadgeRunSummary> {
    let res = db
        .call_named("assign_monthly_badges", move |conn| {
            assign_monthly_badges(conn, month, min_predictions)
        })
        .await;

    match &res {
        Ok(summary) => {
            metrics::counter!("pulse_badge_runs_total", "status" => "ok").increment(1);
            metrics::counter!("pulse_badges_assigned_total").increment(summary.awarded as u64);
            tracing::info!(
                month = %summary.month,
                ranked = summary.ranked,
                awarded = summary.awarded,
                "monthly badge run complete"
            );
        }
        Err(err) => {
            metrics::counter!("pulse_badge_runs_total", "status" => "err").increment(1);
            tracing::error!(month = %month, error = %err, "monthly badge run failed");
        }
    }
    res
}

/// A password-stripped leaderboard row for client display.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TopPredictor {
    pub id: i64,
    pub username: String,
    pub accuracy_percentage: String,
    pub total_predictions: u32,
    pub rank: u32,
    pub current_badge: Option<String>,
    pub is_verified_advisor: bool,
}

/// Read the top predictors for a month, rank ascending.
pub fn top_predictors(
    conn: &Connection,
    month: MonthYear,
    limit: u32,
) -> Result<Vec<TopPredictor>> {
    let mut stmt = conn.prepare(
        "SELECT le.user_id, le.username, le.accuracy_percentage, le.total_predictions,
                le.rank, u.current_badge, u.is_verified_advisor
         FROM leaderboard_entries le
         JOIN users u ON u.id = le.user_id
         WHERE le.month_year = ?1
         ORDER BY le.rank ASC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![month.to_string(), limit], |row| {
            Ok(TopPredictor {
                id: row.get(0)?,
                username: row.get(1)?,
                accuracy_percentage: row.get(2)?,
                total_predictions: row.get(3)?,
                rank: row.get(4)?,
                current_badge: row.get(5)?,
                is_verified_advisor: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::db::Database;

    const MONTH: &str = "2025-04";

    fn month() -> MonthYear {
        MonthYear::parse(MONTH).unwrap()
    }

    fn seed_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        db.conn
            .execute(
                "INSERT INTO assets (symbol, name, category) VALUES ('BTC', 'Bitcoin', 'crypto')",
                [],
            )
            .unwrap();
        db
    }

    fn seed_user(conn: &Connection, username: &str) -> i64 {
        conn.execute(
            "INSERT INTO users (username, password_hash) VALUES (?1, 'x')",
            [username],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    /// Insert `total` opinions dated inside MONTH for `user_id`, of which
    /// the first `accurate` get a was_accurate result and the rest an
    /// inaccurate one.
    fn seed_month_activity(conn: &Connection, user_id: i64, username: &str, total: u32, accurate: u32) {
        for i in 0..total {
            conn.execute(
                "INSERT INTO opinions (user_id, asset_id, username, sentiment, prediction, created_at)
                 VALUES (?1, 1, ?2, 'positive', '10', ?3)",
                rusqlite::params![user_id, username, format!("{MONTH}-10 08:00:{:02}", i % 60)],
            )
            .unwrap();
            let opinion_id = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO prediction_results
                     (opinion_id, user_id, asset_id, original_prediction, actual_result, was_accurate)
                 VALUES (?1, ?2, 1, '10', '12', ?3)",
                rusqlite::params![opinion_id, user_id, (i < accurate) as i64],
            )
            .unwrap();
        }
    }

    #[test]
    fn test_accuracy_is_exact() {
        let stats = MonthlyStats {
            user_id: 1,
            username: "a".into(),
            predictions: 3,
            accurate: 1,
        };
        assert_eq!(stats.accuracy().to_string(), "33.33");
    }

    #[test]
    fn test_rank_orders_by_accuracy_then_count() {
        let ranked = rank_predictors(vec![
            MonthlyStats { user_id: 1, username: "low".into(), predictions: 10, accurate: 5 },
            MonthlyStats { user_id: 2, username: "high".into(), predictions: 8, accurate: 7 },
            MonthlyStats { user_id: 3, username: "tied_more".into(), predictions: 20, accurate: 10 },
        ]);
        // high: 87.5, tied_more: 50 with 20 preds, low: 50 with 10 preds.
        assert_eq!(ranked[0].stats.username, "high");
        assert_eq!(ranked[1].stats.username, "tied_more");
        assert_eq!(ranked[2].stats.username, "low");
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[2].rank, 3);
    }

    #[test]
    fn test_full_tie_keeps_input_order() {
        let ranked = rank_predictors(vec![
            MonthlyStats { user_id: 1, username: "first".into(), predictions: 10, accurate: 5 },
            MonthlyStats { user_id: 2, username: "second".into(), predictions: 10, accurate: 5 },
        ]);
        assert_eq!(ranked[0].stats.username, "first");
        assert_eq!(ranked[1].stats.username, "second");
    }

    #[test]
    fn test_badges_only_for_top_five() {
        let stats = (0..7)
            .map(|i| MonthlyStats {
                user_id: i,
                username: format!("u{i}"),
                predictions: 10,
                accurate: 10 - i as u32,
            })
            .collect();
        let ranked = rank_predictors(stats);
        assert_eq!(ranked[0].badge, Some(BadgeTier::Top1));
        assert_eq!(ranked[4].badge, Some(BadgeTier::Top5));
        assert_eq!(ranked[5].badge, None);
        assert_eq!(ranked[6].badge, None);
    }

    #[test]
    fn test_users_below_minimum_never_ranked() {
        let db = seed_db();
        let a = seed_user(&db.conn, "active");
        let b = seed_user(&db.conn, "casual");
        seed_month_activity(&db.conn, a, "active", 5, 5);
        seed_month_activity(&db.conn, b, "casual", 4, 4); // below min of 5

        let mut conn = db.conn;
        let summary = assign_monthly_badges(&mut conn, month(), 5).unwrap();
        assert_eq!(summary.ranked, 1);
        assert_eq!(summary.awarded, 1);

        let entries: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM leaderboard_entries WHERE month_year = ?1",
                [MONTH],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_run_is_idempotent() {
        let db = seed_db();
        for i in 0..6 {
            let name = format!("user{i}");
            let id = seed_user(&db.conn, &name);
            seed_month_activity(&db.conn, id, &name, 6, 6 - i as u32);
        }

        let mut conn = db.conn;
        assign_monthly_badges(&mut conn, month(), 5).unwrap();
        assign_monthly_badges(&mut conn, month(), 5).unwrap();

        let badge_rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM user_badges WHERE month_year = ?1",
                [MONTH],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(badge_rows, 5, "exactly one badge row per awarded user");

        let max_per_user: i64 = conn
            .query_row(
                "SELECT MAX(n) FROM (SELECT COUNT(*) AS n FROM user_badges
                 WHERE month_year = ?1 GROUP BY user_id)",
                [MONTH],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(max_per_user, 1);

        let entry_rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM leaderboard_entries WHERE month_year = ?1",
                [MONTH],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(entry_rows, 6, "full ranked list, once");
    }

    #[test]
    fn test_current_badge_cleared_and_reassigned() {
        let db = seed_db();
        let stale = seed_user(&db.conn, "former_champion");
        db.conn
            .execute(
                "UPDATE users SET current_badge = 'top1' WHERE id = ?1",
                [stale],
            )
            .unwrap();
        let winner = seed_user(&db.conn, "winner");
        seed_month_activity(&db.conn, winner, "winner", 5, 5);

        let mut conn = db.conn;
        assign_monthly_badges(&mut conn, month(), 5).unwrap();

        let stale_badge: Option<String> = conn
            .query_row("SELECT current_badge FROM users WHERE id = ?1", [stale], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(stale_badge, None);

        let winner_badge: Option<String> = conn
            .query_row("SELECT current_badge FROM users WHERE id = ?1", [winner], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(winner_badge, Some("top1".to_string()));
    }

    #[test]
    fn test_tie_on_accuracy_broken_by_prediction_count() {
        let db = seed_db();
        let few = seed_user(&db.conn, "few");
        let many = seed_user(&db.conn, "many");
        // Equal accuracy (100%), different volume. Seed "few" first so input
        // order alone would rank them first.
        seed_month_activity(&db.conn, few, "few", 5, 5);
        seed_month_activity(&db.conn, many, "many", 10, 10);

        let mut conn = db.conn;
        assign_monthly_badges(&mut conn, month(), 5).unwrap();

        let top: String = conn
            .query_row(
                "SELECT username FROM leaderboard_entries WHERE month_year = ?1 AND rank = 1",
                [MONTH],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(top, "many");
    }

    #[test]
    fn test_empty_month_is_a_clean_noop() {
        let db = seed_db();
        let mut conn = db.conn;
        let summary = assign_monthly_badges(&mut conn, month(), 5).unwrap();
        assert_eq!(summary.ranked, 0);
        assert_eq!(summary.awarded, 0);
    }

    #[test]
    fn test_top_predictors_respects_limit_and_rank_order() {
        let db = seed_db();
        for i in 0..5 {
            let name = format!("user{i}");
            let id = seed_user(&db.conn, &name);
            seed_month_activity(&db.conn, id, &name, 8, 8 - i as u32);
        }
        let mut conn = db.conn;
        assign_monthly_badges(&mut conn, month(), 5).unwrap();

        let top = top_predictors(&conn, month(), 3).unwrap();
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].rank, 1);
        assert_eq!(top[1].rank, 2);
        assert_eq!(top[2].rank, 3);
        assert_eq!(top[0].username, "user0");
        assert_eq!(top[0].current_badge, Some("top1".to_string()));
    }

    #[test]
    fn test_lifetime_accuracy_refreshed_for_ranked_users() {
        let db = seed_db();
        let id = seed_user(&db.conn, "alice");
        seed_month_activity(&db.conn, id, "alice", 8, 6);

        let mut conn = db.conn;
        assign_monthly_badges(&mut conn, month(), 5).unwrap();

        let (accurate, accuracy): (u32, String) = conn
            .query_row(
                "SELECT accurate_predictions, accuracy_percentage FROM users WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(accurate, 6);
        assert_eq!(accuracy, "75.00");
    }

    #[tokio::test]
    async fn test_run_for_month_via_async_db() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        db.call(|conn| {
            conn.execute(
                "INSERT INTO assets (symbol, name, category) VALUES ('BTC', 'Bitcoin', 'crypto')",
                [],
            )?;
            conn.execute(
                "INSERT INTO users (username, password_hash) VALUES ('alice', 'x')",
                [],
            )?;
            for i in 0..5 {
                conn.execute(
                    "INSERT INTO opinions (user_id, asset_id, username, sentiment, prediction, created_at)
                     VALUES (1, 1, 'alice', 'positive', '10', ?1)",
                    [format!("2025-04-0{} 12:00:00", i + 1)],
                )?;
            }
            Ok(())
        })
        .await
        .unwrap();

        let summary = run_for_month(&db, MonthYear::parse("2025-04").unwrap(), 5)
            .await
            .unwrap();
        assert_eq!(summary.ranked, 1);
        assert_eq!(summary.awarded, 1);
    }
}

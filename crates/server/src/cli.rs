use anyhow::Result;
use common::db::Database;
use common::types::MonthYear;

use crate::api::auth::hash_password;
use crate::rankings::assign_monthly_badges;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    AssignBadges { month: MonthYear },
    Leaderboard { month: MonthYear },
    Users,
    CreateAdmin { username: String, password: String },
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "assign-badges" => {
            let month = parse_month(args.next(), "server assign-badges <YYYY-MM>")?;
            Ok(Command::AssignBadges { month })
        }
        "leaderboard" => {
            let month = parse_month(args.next(), "server leaderboard <YYYY-MM>")?;
            Ok(Command::Leaderboard { month })
        }
        "users" => Ok(Command::Users),
        "create-admin" => {
            let username = args
                .next()
                .ok_or_else(|| "usage: server create-admin <username> <password>".to_string())?;
            let password = args
                .next()
                .ok_or_else(|| "usage: server create-admin <username> <password>".to_string())?;
            Ok(Command::CreateAdmin { username, password })
        }
        other => Err(format!("unknown command: {other}")),
    }
}

fn parse_month(arg: Option<String>, usage: &str) -> std::result::Result<MonthYear, String> {
    let raw = arg.ok_or_else(|| format!("usage: {usage}"))?;
    raw.parse().map_err(|_| format!("bad month {raw:?}: {usage}"))
}

pub fn run_command(db: &mut Database, cmd: Command, min_monthly_predictions: u32) -> Result<()> {
    match cmd {
        Command::Run => Ok(()),
        Command::AssignBadges { month } => assign_badges(db, month, min_monthly_predictions),
        Command::Leaderboard { month } => show_leaderboard(db, month),
        Command::Users => show_users(db),
        Command::CreateAdmin { username, password } => create_admin(db, &username, &password),
    }
}

fn assign_badges(db: &mut Database, month: MonthYear, min_predictions: u32) -> Result<()> {
    let summary = assign_monthly_badges(&mut db.conn, month, min_predictions)?;
    println!(
        "{month}: ranked {} users, awarded {} badges",
        summary.ranked, summary.awarded
    );
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaderboardRow {
    pub rank: u32,
    pub username: String,
    pub accuracy_percentage: String,
    pub total_predictions: u32,
}

pub fn query_leaderboard(db: &Database, month: MonthYear) -> Result<Vec<LeaderboardRow>> {
    let mut stmt = db.conn.prepare(
        r#"
        SELECT rank, username, accuracy_percentage, total_predictions
        FROM leaderboard_entries
        WHERE month_year = ?1
        ORDER BY rank ASC
        "#,
    )?;
    let rows = stmt.query_map([month.to_string()], |row| {
        Ok(LeaderboardRow {
            rank: row.get(0)?,
            username: row.get(1)?,
            accuracy_percentage: row.get(2)?,
            total_predictions: row.get(3)?,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

fn show_leaderboard(db: &Database, month: MonthYear) -> Result<()> {
    println!("Leaderboard ({month}):");
    for r in query_leaderboard(db, month)? {
        println!(
            "{rank:>3}  {acc:>7}%  predictions={n}  {user}",
            rank = r.rank,
            acc = r.accuracy_percentage,
            n = r.total_predictions,
            user = r.username
        );
    }
    Ok(())
}

fn show_users(db: &Database) -> Result<()> {
    let mut stmt = db.conn.prepare(
        r#"
        SELECT username, is_admin, total_predictions, accuracy_percentage,
               is_verified_advisor, current_badge
        FROM users
        ORDER BY id ASC
        "#,
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, bool>(1)?,
            row.get::<_, u32>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, bool>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    println!("Users:");
    for r in rows {
        let (username, is_admin, predictions, accuracy, verified, badge) = r?;
        println!(
            "{username}  admin={is_admin}  predictions={predictions}  accuracy={accuracy}%  verified={verified}  badge={badge:?}"
        );
    }
    Ok(())
}

fn create_admin(db: &Database, username: &str, password: &str) -> Result<()> {
    let hash = hash_password(password);
    db.conn.execute(
        "INSERT INTO users (username, password_hash, is_admin) VALUES (?1, ?2, 1)
         ON CONFLICT(username) DO UPDATE SET is_admin = 1",
        rusqlite::params![username, hash],
    )?;
    println!("admin user {username} ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn month(s: &str) -> MonthYear {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_args_defaults_to_run() {
        let cmd = parse_args(vec!["server".to_string()].into_iter()).unwrap();
        assert_eq!(cmd, Command::Run);
    }

    #[test]
    fn test_parse_assign_badges() {
        let cmd = parse_args(
            vec![
                "server".to_string(),
                "assign-badges".to_string(),
                "2025-06".to_string(),
            ]
            .into_iter(),
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::AssignBadges {
                month: month("2025-06")
            }
        );
    }

    #[test]
    fn test_parse_assign_badges_rejects_unpadded_month() {
        let err = parse_args(
            vec![
                "server".to_string(),
                "assign-badges".to_string(),
                "2025-6".to_string(),
            ]
            .into_iter(),
        )
        .unwrap_err();
        assert!(err.contains("2025-6"));
    }

    #[test]
    fn test_parse_unknown_command() {
        let err =
            parse_args(vec!["server".to_string(), "frobnicate".to_string()].into_iter())
                .unwrap_err();
        assert!(err.contains("frobnicate"));
    }

    #[test]
    fn test_create_admin_is_idempotent() {
        let mut db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        run_command(
            &mut db,
            Command::CreateAdmin {
                username: "root".into(),
                password: "hunter2!".into(),
            },
            5,
        )
        .unwrap();
        run_command(
            &mut db,
            Command::CreateAdmin {
                username: "root".into(),
                password: "hunter2!".into(),
            },
            5,
        )
        .unwrap();

        let (count, is_admin): (u32, bool) = db
            .conn
            .query_row(
                "SELECT COUNT(*), MAX(is_admin) FROM users WHERE username = 'root'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert!(is_admin);
    }

    #[test]
    fn test_query_leaderboard_orders_by_rank() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        for (user, rank) in [("second", 2), ("first", 1)] {
            db.conn
                .execute(
                    "INSERT INTO users (username, password_hash) VALUES (?1, 'x')",
                    [user],
                )
                .unwrap();
            db.conn
                .execute(
                    "INSERT INTO leaderboard_entries
                         (user_id, username, rank, month_year)
                     VALUES ((SELECT id FROM users WHERE username = ?1), ?1, ?2, '2025-06')",
                    rusqlite::params![user, rank],
                )
                .unwrap();
        }

        let rows = query_leaderboard(&db, month("2025-06")).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].username, "first");
        assert_eq!(rows[1].username, "second");
    }
}

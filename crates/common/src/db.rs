use anyhow::Result;
use rusqlite::Connection;

/// Sync database handle for CLI commands and tests.
pub struct Database {
    pub conn: Connection,
}

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// Runs all SQLite operations on a dedicated background thread via
/// `tokio_rusqlite`, keeping the Tokio runtime cooperative. Clone is
/// cheap (shared mpsc sender to the background thread).
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path`, set PRAGMAs (WAL, foreign keys, busy_timeout),
    /// and run migrations on the background thread.
    ///
    /// Startup migrations take a write lock and can race with concurrent
    /// writers (a second server instance, an admin sqlite3 session). Rather
    /// than crash-looping under a supervisor on `database is locked`, retry
    /// with backoff until the lock clears. busy_timeout is kept short per
    /// attempt so the backoff is handled here in Rust.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        let mut backoff = std::time::Duration::from_secs(1);
        let max_backoff = std::time::Duration::from_secs(30);
        let max_total_wait = std::time::Duration::from_secs(10 * 60);
        let start = std::time::Instant::now();

        loop {
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(std::time::Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                    conn.execute_batch(SCHEMA)?;
                    migrate_users_is_admin(conn)?;
                    // Normal runtime operations get the longer busy_timeout back.
                    conn.busy_timeout(std::time::Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) => {
                    let is_locked = matches!(
                        err,
                        rusqlite::Error::SqliteFailure(
                            rusqlite::ffi::Error {
                                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                                ..
                            },
                            _,
                        )
                    );
                    if !is_locked {
                        return Err(
                            anyhow::Error::from(err).context("AsyncDb::open: migration failed")
                        );
                    }

                    if start.elapsed() >= max_total_wait {
                        return Err(anyhow::Error::from(err).context(
                            "AsyncDb::open: migration failed (database stayed locked too long)",
                        ));
                    }

                    tracing::warn!(
                        wait_for = ?backoff,
                        "AsyncDb::open: database is locked; retrying migrations"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records Prometheus metrics for DB latency and
    /// errors. Measures full wall-clock time including queueing on the
    /// dedicated SQLite thread.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        match &res {
            Ok(_) => {
                metrics::histogram!(
                    "pulse_db_query_latency_ms",
                    "op" => op,
                    "status" => "ok"
                )
                .record(ms);
            }
            Err(_) => {
                metrics::histogram!(
                    "pulse_db_query_latency_ms",
                    "op" => op,
                    "status" => "err"
                )
                .record(ms);
                metrics::counter!("pulse_db_query_errors_total", "op" => op).increment(1);
            }
        }

        res
    }
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // busy_timeout via the rusqlite API — makes SQLite retry for up to 30s
        // when the database is locked by another connection.
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    pub fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        migrate_users_is_admin(&self.conn).map_err(anyhow::Error::from)?;
        Ok(())
    }
}

/// Add is_admin to users if missing (for DBs created before the explicit
/// admin role replaced the hardcoded username check).
fn migrate_users_is_admin(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    let has: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info('users') WHERE name='is_admin'",
        [],
        |row| row.get(0),
    )?;
    if has == 0 {
        conn.execute(
            "ALTER TABLE users ADD COLUMN is_admin INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

// Decimal-valued columns (prediction, accuracy_percentage) are stored as TEXT
// and parsed with rust_decimal so aggregates never accumulate float drift.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    is_admin INTEGER NOT NULL DEFAULT 0,
    total_predictions INTEGER NOT NULL DEFAULT 0,
    accurate_predictions INTEGER NOT NULL DEFAULT 0,
    accuracy_percentage TEXT NOT NULL DEFAULT '0',
    is_verified_advisor INTEGER NOT NULL DEFAULT 0,
    current_badge TEXT,                -- top1..top5, projection of user_badges
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS assets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    category TEXT NOT NULL,            -- stock, crypto
    sentiment TEXT NOT NULL DEFAULT 'neutral',
    prediction TEXT NOT NULL DEFAULT '0'
);

CREATE TABLE IF NOT EXISTS opinions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    asset_id INTEGER NOT NULL REFERENCES assets(id),
    username TEXT NOT NULL,
    sentiment TEXT NOT NULL,           -- positive, neutral, negative
    prediction TEXT NOT NULL,          -- signed percentage, -100..1000
    comment TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS prediction_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    opinion_id INTEGER NOT NULL REFERENCES opinions(id),
    user_id INTEGER NOT NULL REFERENCES users(id),
    asset_id INTEGER NOT NULL REFERENCES assets(id),
    original_prediction TEXT NOT NULL,
    actual_result TEXT NOT NULL,
    was_accurate INTEGER NOT NULL,     -- 1|0
    verified_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS user_badges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    username TEXT NOT NULL,
    badge_type TEXT NOT NULL,          -- top1..top5
    month_year TEXT NOT NULL,          -- YYYY-MM
    accuracy_percentage TEXT NOT NULL DEFAULT '0',
    total_predictions INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(user_id, month_year)
);

CREATE TABLE IF NOT EXISTS leaderboard_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    username TEXT NOT NULL,
    total_predictions INTEGER NOT NULL DEFAULT 0,
    accurate_predictions INTEGER NOT NULL DEFAULT 0,
    accuracy_percentage TEXT NOT NULL DEFAULT '0',
    rank INTEGER NOT NULL,
    month_year TEXT NOT NULL,          -- YYYY-MM
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(user_id, month_year)
);

CREATE TABLE IF NOT EXISTS sessions (
    token TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id),
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_opinions_asset ON opinions(asset_id);
CREATE INDEX IF NOT EXISTS idx_opinions_user ON opinions(user_id);
CREATE INDEX IF NOT EXISTS idx_opinions_created_at ON opinions(created_at);
CREATE INDEX IF NOT EXISTS idx_prediction_results_opinion ON prediction_results(opinion_id);
CREATE INDEX IF NOT EXISTS idx_prediction_results_user ON prediction_results(user_id);
CREATE INDEX IF NOT EXISTS idx_user_badges_user ON user_badges(user_id);
CREATE INDEX IF NOT EXISTS idx_leaderboard_month_rank ON leaderboard_entries(month_year, rank);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
"#;

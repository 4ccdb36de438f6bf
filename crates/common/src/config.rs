use anyhow::Result;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub server: Server,
    pub badges: Badges,
    pub verification: Verification,
    pub observability: Observability,
}

#[derive(Debug, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Server {
    pub host: String,
    pub port: u16,
    pub session_ttl_hours: u32,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct Badges {
    /// Users below this many predictions in a month never appear in that
    /// month's ranking.
    pub min_monthly_predictions: u32,
    /// When false the in-process month-boundary scheduler is not started;
    /// badge runs then come from cron (`server assign-badges YYYY-MM`) or
    /// the admin endpoint.
    pub scheduler_enabled: bool,
    /// Hour of day (UTC) for the first-of-month scheduled run.
    pub run_hour: u32,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct Verification {
    pub min_account_age_months: u32,
    pub min_predictions: u32,
}

#[derive(Debug, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

impl Config {
    pub fn load() -> Result<Self> {
        let content = std::fs::read_to_string("config/default.toml")?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}

use std::str::FromStr;

use serde::Deserialize;

use crate::models::policy::check_timeout_hours;

/// Which `GovernanceStore` backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Postgres,
    Memory,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(StoreKind::Postgres),
            "memory" | "mem" => Ok(StoreKind::Memory),
            other => anyhow::bail!("unknown COSTGOV_STORE '{}': expected 'postgres' or 'memory'", other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub store: StoreKind,
    pub admin_key: Option<String>,
    pub env: String,
    /// Seconds between timeout sweeps. Set via COSTGOV_SWEEP_INTERVAL_SECS. Default: 60.
    pub sweep_interval_secs: u64,
    /// Max workflows expired per sweep tick.
    pub sweep_batch_size: i64,
    pub slack_webhook_url: Option<String>,
    /// Comma-separated list of webhook URLs to notify on governance events.
    pub webhook_urls: Vec<String>,
    pub webhook_secret: Option<String>,
    pub escalation_timeout_hours: i64,
}

impl Config {
    pub fn is_production(&self) -> bool {
        self.env == "production"
    }
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn escalation_timeout(hours: i64) -> anyhow::Result<i64> {
    check_timeout_hours("COSTGOV_ESCALATION_TIMEOUT_HOURS", hours).map_err(anyhow::Error::msg)?;
    Ok(hours)
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    from_env()
}

/// Build the config from the current process environment.
pub fn from_env() -> anyhow::Result<Config> {
    let env = std::env::var("COSTGOV_ENV")
        .or_else(|_| std::env::var("RUST_ENV"))
        .unwrap_or_else(|_| "development".into());

    let admin_key = non_empty("COSTGOV_ADMIN_KEY");
    if admin_key.is_none() {
        if env == "production" {
            anyhow::bail!("COSTGOV_ADMIN_KEY must be set when COSTGOV_ENV=production");
        }
        eprintln!("WARNING: COSTGOV_ADMIN_KEY is not set; the management API will reject every request.");
    }

    let store = match non_empty("COSTGOV_STORE") {
        Some(s) => s.parse()?,
        None => StoreKind::Postgres,
    };

    let escalation_timeout_hours =
        escalation_timeout(parsed_or("COSTGOV_ESCALATION_TIMEOUT_HOURS", 72i64))?;

    Ok(Config {
        port: parsed_or("COSTGOV_PORT", 8443),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/costgov".into()),
        store,
        admin_key,
        env,
        sweep_interval_secs: parsed_or("COSTGOV_SWEEP_INTERVAL_SECS", 60u64).max(1),
        sweep_batch_size: parsed_or("COSTGOV_SWEEP_BATCH_SIZE", 100i64).max(1),
        slack_webhook_url: non_empty("COSTGOV_SLACK_WEBHOOK_URL"),
        webhook_urls: std::env::var("COSTGOV_WEBHOOK_URLS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        webhook_secret: non_empty("COSTGOV_WEBHOOK_SECRET"),
        escalation_timeout_hours,
    })
}

use crate::fine::{LoanPolicy, DEFAULT_FINE_PER_DAY, DEFAULT_LOAN_DAYS, MAX_LOAN_DAYS};
use anyhow::{bail, Context};
use chrono::Duration;
use std::{env, path::PathBuf, str::FromStr};

pub const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminSeed {
    pub name: String,
    pub email: String,
    pub password: String,
}

/// Start-up settings, read once from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    pub data_file: Option<PathBuf>,
    pub admin: Option<AdminSeed>,
    pub policy: LoanPolicy,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        // an unusable port falls back to the default rather than aborting
        let port = get("PORT")
            .and_then(|text| text.trim().parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let admin = match (get("ADMIN_EMAIL"), get("ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(AdminSeed {
                name: get("ADMIN_NAME").unwrap_or_else(|| "Administrator".to_string()),
                email,
                password,
            }),
            (None, None) => None,
            _ => bail!("ADMIN_EMAIL and ADMIN_PASSWORD must be set together"),
        };

        let fine_per_day: u64 = parse_or(get("FINE_PER_DAY"), DEFAULT_FINE_PER_DAY)
            .context("FINE_PER_DAY must be a non-negative integer")?;
        let loan_days: i64 = parse_or(get("LOAN_DAYS"), DEFAULT_LOAN_DAYS)
            .context("LOAN_DAYS must be an integer")?;
        if !(1..=MAX_LOAN_DAYS).contains(&loan_days) {
            bail!("LOAN_DAYS must be between 1 and {MAX_LOAN_DAYS}, got {loan_days}");
        }

        Ok(Config {
            port,
            database_url: get("DATABASE_URL"),
            data_file: get("LIBRARY_DATA_FILE").map(PathBuf::from),
            admin,
            policy: LoanPolicy {
                loan_period: Duration::days(loan_days),
                fine_per_day,
            },
        })
    }
}

fn parse_or<T>(value: Option<String>, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(text) => Ok(text.trim().parse()?),
        None => Ok(default),
    }
}

//! Migration pipelines: fetch -> map -> normalize -> upsert -> verify.

use std::fmt;
use std::process::ExitCode;

use anyhow::{Context, Result};
use rhwb_source::{SupabaseConfig, DEFAULT_PAGE_SIZE};
use rhwb_target::{TargetConfig, TargetConnection, TargetConnector, UpsertRecord, DEFAULT_BATCH_SIZE};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub mod qual_scores;
pub mod veer_feedback;

pub const CRATE_NAME: &str = "rhwb-migrate";

pub const ENV_SUPABASE_URL: &str = "SUPABASE_URL";
pub const ENV_SUPABASE_SERVICE_KEY: &str = "SUPABASE_SERVICE_KEY";
pub const ENV_CLOUD_SQL_HOST: &str = "CLOUD_SQL_HOST";
pub const ENV_CLOUD_SQL_PORT: &str = "CLOUD_SQL_PORT";
pub const ENV_CLOUD_SQL_DATABASE: &str = "CLOUD_SQL_DATABASE";
pub const ENV_CLOUD_SQL_USER: &str = "CLOUD_SQL_USER";
pub const ENV_CLOUD_SQL_PASSWORD: &str = "CLOUD_SQL_PASSWORD";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value {value:?} for {name}")]
    InvalidVar { name: &'static str, value: String },
}

/// Everything a run needs, built once at startup and passed to each stage.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub source: SupabaseConfig,
    pub target: TargetConfig,
    pub page_size: usize,
    pub batch_size: usize,
}

impl MigrationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset and blank values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| get(name).ok_or(ConfigError::MissingVar(name));

        let port = match get(ENV_CLOUD_SQL_PORT) {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| ConfigError::InvalidVar {
                name: ENV_CLOUD_SQL_PORT,
                value: raw,
            })?,
            None => 5432,
        };

        Ok(Self {
            source: SupabaseConfig {
                url: required(ENV_SUPABASE_URL)?,
                service_key: required(ENV_SUPABASE_SERVICE_KEY)?,
            },
            target: TargetConfig {
                host: required(ENV_CLOUD_SQL_HOST)?,
                port,
                database: required(ENV_CLOUD_SQL_DATABASE)?,
                user: required(ENV_CLOUD_SQL_USER)?,
                password: required(ENV_CLOUD_SQL_PASSWORD)?,
            },
            page_size: DEFAULT_PAGE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }
}

/// Reconciliation between records prepared and records the target accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verification {
    Matched,
    Mismatch { prepared: usize, upserted: usize },
}

impl Verification {
    pub fn check(prepared: usize, upserted: usize) -> Self {
        if prepared == upserted {
            Self::Matched
        } else {
            Self::Mismatch { prepared, upserted }
        }
    }

    pub fn is_matched(self) -> bool {
        matches!(self, Self::Matched)
    }

    pub fn exit_code(self) -> ExitCode {
        if self.is_matched() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matched => write!(f, "  Migration completed successfully."),
            Self::Mismatch { prepared, upserted } => write!(
                f,
                "  WARNING: Upsert count does not match prepared records ({upserted} upserted, {prepared} prepared)."
            ),
        }
    }
}

/// Numbered progress line. Stage 1 (connecting to Supabase) is logged by the
/// binary before a pipeline starts.
pub fn stage(number: u8, title: &str) {
    info!(stage = number, "{number}. {title}");
}

/// Open one target connection, upsert `records`, and close the connection
/// whether or not the upsert succeeded.
pub async fn upsert_and_close<R, C>(target: &C, records: &[R], batch_size: usize) -> Result<usize>
where
    R: UpsertRecord,
    C: TargetConnector<R> + ?Sized,
{
    let mut conn = target
        .connect()
        .await
        .context("connecting to Cloud SQL")?;
    let upserted = conn.upsert(records, batch_size).await;
    let closed = conn.close().await;

    let upserted = upserted.with_context(|| format!("upserting into {}", R::TABLE))?;
    if let Err(err) = closed {
        warn!(error = %err, "closing Cloud SQL connection failed after a successful upsert");
    }
    info!("Successfully upserted {upserted} records into Cloud SQL.");
    Ok(upserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn full_env() -> HashMap<&'static str, String> {
        HashMap::from([
            (ENV_SUPABASE_URL, "https://project.supabase.co".to_string()),
            (ENV_SUPABASE_SERVICE_KEY, "service-key".to_string()),
            (ENV_CLOUD_SQL_HOST, "/cloudsql/p:r:i".to_string()),
            (ENV_CLOUD_SQL_DATABASE, "rhwb".to_string()),
            (ENV_CLOUD_SQL_USER, "migrator".to_string()),
            (ENV_CLOUD_SQL_PASSWORD, "secret".to_string()),
        ])
    }

    #[test]
    fn config_builds_from_lookup_with_defaults() {
        let env = full_env();
        let config = MigrationConfig::from_lookup(|k| env.get(k).cloned()).expect("config");

        assert_eq!(config.source.url, "https://project.supabase.co");
        assert_eq!(config.target.host, "/cloudsql/p:r:i");
        assert_eq!(config.target.port, 5432);
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.batch_size, 500);
    }

    #[test]
    fn missing_variable_is_named() {
        let mut env = full_env();
        env.remove(ENV_CLOUD_SQL_PASSWORD);
        let err = MigrationConfig::from_lookup(|k| env.get(k).cloned()).unwrap_err();
        assert_eq!(err, ConfigError::MissingVar("CLOUD_SQL_PASSWORD"));

        env.insert(ENV_CLOUD_SQL_PASSWORD, "secret".to_string());
        env.insert(ENV_SUPABASE_URL, "   ".to_string());
        let err = MigrationConfig::from_lookup(|k| env.get(k).cloned()).unwrap_err();
        assert_eq!(err, ConfigError::MissingVar("SUPABASE_URL"));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let mut env = full_env();
        env.insert(ENV_CLOUD_SQL_PORT, "five".to_string());
        let err = MigrationConfig::from_lookup(|k| env.get(k).cloned()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name: "CLOUD_SQL_PORT", .. }));
    }

    #[test]
    fn zero_prepared_and_zero_upserted_is_a_match() {
        assert_eq!(Verification::check(0, 0), Verification::Matched);
        assert_eq!(
            Verification::check(3, 2),
            Verification::Mismatch {
                prepared: 3,
                upserted: 2
            }
        );
        assert_eq!(Verification::check(3, 2).exit_code(), ExitCode::FAILURE);
        assert_eq!(Verification::Matched.exit_code(), ExitCode::SUCCESS);
    }
}

//! Shared startup for the migration binaries.

use anyhow::{Context, Result};
use rhwb_migrate::MigrationConfig;
use rhwb_source::SupabaseClient;
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

pub const CRATE_NAME: &str = "rhwb-cli";

/// Install the global fmt subscriber. `RUST_LOG` overrides `default_filter`.
///
/// Targets are left off: the log lines are the operator-facing progress
/// report of a one-shot run, so each line reads as the stage message alone.
pub fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

/// Read configuration from the environment and build the Supabase client.
pub fn startup(title: &str) -> Result<(MigrationConfig, SupabaseClient)> {
    init_tracing("info")?;
    info!("=== {title}: Supabase -> Cloud SQL ===");
    let config = MigrationConfig::from_env().context("loading configuration")?;
    rhwb_migrate::stage(1, "Connecting to Supabase...");
    let source = SupabaseClient::new(&config.source)?;
    Ok((config, source))
}

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use rhwb_migrate::veer_feedback;

/// Copy veer feedback from Supabase into the Cloud SQL `veer_feedback` table.
#[derive(Debug, Parser)]
#[command(name = "migrate-veer-feedback", version)]
struct Cli {}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    Cli::parse();
    let (config, source) = rhwb_cli::startup("Veer Feedback Migration")?;

    let summary = veer_feedback::run(&config, &source, &config.target).await?;
    println!("{summary}");
    Ok(summary.verification.exit_code())
}

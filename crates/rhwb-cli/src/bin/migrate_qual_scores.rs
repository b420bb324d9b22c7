use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use rhwb_migrate::qual_scores;

/// Copy qual scores from Supabase into the Cloud SQL `qual_scores` table.
#[derive(Debug, Parser)]
#[command(name = "migrate-qual-scores", version)]
struct Cli {}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    Cli::parse();
    let (config, source) = rhwb_cli::startup("Qual Score Migration")?;

    let summary = qual_scores::run(&config, &source, &config.target).await?;
    println!("{summary}");
    Ok(summary.verification.exit_code())
}

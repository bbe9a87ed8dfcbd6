use anyhow::{Context, Result};
use clap::Parser;
use execstat::{ExecStatEngine, parse_args, settings::Settings};

/// Export per-process execve counts from a pinned BPF map as Prometheus metrics.
#[derive(Debug, Parser)]
#[command(version)]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Print the aggregate table after every sample
    #[clap(long)]
    report: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt: Opt = parse_args();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let settings = Settings::new().context("Failed to load settings")?;

    ExecStatEngine::new(settings)
        .with_report(opt.report)
        .run()
        .await
}

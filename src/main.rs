//! corral CLI: deploy and destroy declarative stacks of instances.

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter (default `warn`).
const LOG_ENV: &str = "CORRAL_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "corral",
    version,
    about = "Deploy and destroy stacks of instances through orchestrator, initializer and configurer plugins"
)]
struct Cli {
    #[command(subcommand)]
    command: corral::cli::Commands,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let response = corral::cli::dispatch(cli.command).await;
    println!("{}", response.to_json());
    if !response.is_ok() {
        std::process::exit(1);
    }
}

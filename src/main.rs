//! egressguard - default-deny outbound firewall for sandboxed containers.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use egressguard::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Apply {
            dry_run,
            skip_verify,
        } => egressguard::commands::apply::run(&cli.config, dry_run, skip_verify).await,
        Commands::Verify => egressguard::commands::verify::run(&cli.config).await,
        Commands::Status => egressguard::commands::status::run().await,
        Commands::Disable => egressguard::commands::disable::run().await,
        Commands::Version => {
            println!("egressguard {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

//! devicelab - run game builds on a pool of devices and judge them by their logs
//!
//! Finds installable builds on disk, deploys them to Android, iOS and desktop
//! devices, runs test sessions and derives verdicts from the application logs.

use clap::Parser;
use devicelab::common::{logging, paths};
use devicelab::{cli, commands};
use commands::Commands;

#[derive(Parser)]
#[command(name = "devicelab", about = "Device test orchestration CLI")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // A scenario run also keeps a persistent log next to the other runs
    let _guard = match &cli.command {
        Commands::Run { log_dir, .. } => match log_dir.clone().or_else(paths::log_dir) {
            Some(dir) => match logging::init_run_log(&dir) {
                Ok((path, guard)) => {
                    tracing::info!("Run log: {}", path.display());
                    Some(guard)
                }
                Err(e) => {
                    logging::init_cli();
                    tracing::warn!("Could not open run log in {}: {}", dir.display(), e);
                    None
                }
            },
            None => {
                logging::init_cli();
                None
            }
        },
        _ => {
            logging::init_cli();
            None
        }
    };

    if let Err(e) = cli::dispatch(cli.command).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

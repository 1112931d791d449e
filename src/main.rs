// Warden - Application Entry Point
//
// Parses CLI arguments, initializes structured logging from the loaded
// configuration (RUST_LOG takes precedence), and dispatches to the
// command handler on the tokio runtime.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use warden::cli::{execute, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG=warden=debug for verbose output. Tokens and signatures are
    // never logged at any level.
    let logging = cli.logging();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(logging.filter_directive())),
        )
        .with_target(false)
        .init();

    if let Err(e) = execute(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

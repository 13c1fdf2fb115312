use anyhow::Result;
use clap::Parser;
use tanuki::cli::{self, Cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = cli::execute(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    Ok(())
}

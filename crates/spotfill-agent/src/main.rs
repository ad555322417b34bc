use clap::Parser;
use spotfill_agent::cli::Cli;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("spotfill_agent=info,info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.run().await {
        Ok(outcome) => {
            info!(outcome = ?outcome, "Termination poll finished");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "Termination poll failed");
            std::process::exit(1);
        }
    }
}

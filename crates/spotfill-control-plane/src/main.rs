use clap::Parser;
use spotfill_control_plane::cli::Cli;
use tracing::{error, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("spotfill_control_plane=info,info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.run().await {
        Ok(output) => {
            println!("{output}");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "Control plane command failed");
            std::process::exit(1);
        }
    }
}

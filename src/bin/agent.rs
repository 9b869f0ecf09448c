use clap::Parser;
use doozer::agent::AgentConfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "doozer-agent", about = "Build agent worker")]
struct Args {
    /// Path to the agent config file
    #[arg(short = 'c', long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doozer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting doozer agent");

    let cfg = AgentConfig::load(args.config.as_deref())?;
    doozer::agent::run(cfg).await?;

    Ok(())
}

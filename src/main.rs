use axum::routing::{get, post, put};
use axum::Router;
use clap::Parser;
use doozer::config::AppConfig;
use doozer::core::Core;
use doozer::database::Database;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "doozer", about = "Buildmaster coordinator")]
struct Args {
    /// Path to the service config file
    #[arg(short = 'c', long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doozer=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting doozer buildmaster");

    let config = AppConfig::load(args.config.as_deref())?;
    info!("Configuration loaded");

    let database = Database::new(&config.database_url).await?;
    info!("Database connected");

    let port = config.http.port;
    let core = Arc::new(Core::new(config, database));

    if let Err(e) = core.registry.reload() {
        warn!("Initial project scan failed: {}", e);
    }

    // SIGHUP rescans the project config tree
    {
        let core = core.clone();
        tokio::spawn(async move {
            let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            {
                Ok(h) => h,
                Err(e) => {
                    error!("Unable to install SIGHUP handler: {}", e);
                    return;
                }
            };
            while hup.recv().await.is_some() {
                info!("Reloading project configs");
                if let Err(e) = core.registry.reload() {
                    error!("Project reload failed: {}", e);
                }
            }
        });
    }

    // Per-project worker dispatcher
    {
        let core = core.clone();
        tokio::spawn(async move {
            doozer::project::worker::run_dispatcher(core).await;
        });
    }

    // Expiry and deleted-artifact reapers
    {
        let core = core.clone();
        tokio::spawn(async move {
            doozer::buildmaster::run_periodic(core).await;
        });
    }

    // Control socket
    {
        let core = core.clone();
        tokio::spawn(async move {
            doozer::ctl::run_ctrl_socket(core).await;
        });
    }

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/buildmaster/hello", get(doozer::buildmaster::api::hello))
        .route("/buildmaster/getjob", get(doozer::buildmaster::api::getjob))
        .route(
            "/buildmaster/artifact",
            put(doozer::buildmaster::api::put_artifact),
        )
        .route("/buildmaster/report", get(doozer::buildmaster::api::report))
        .route("/file/:sha1", get(doozer::artifacts::serve_artifact))
        .route("/github", post(doozer::github::webhook))
        .route(
            "/projects/:org/:name/*rest",
            get(doozer::restapi::projects_dispatch),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(core);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "service": "doozer",
        "timestamp": chrono::Utc::now()
    }))
}

mod cost;
mod handlers;
mod router;
mod state;
mod supervisor;

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use redharvest_core::security::Sealer;
use redharvest_core::storage::{Storage, StoreSpec};

use state::AppState;
use supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "redharvest-server")]
#[command(about = "Control plane for the redharvest scraper fleet")]
#[command(version)]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,
    /// Port for the operator API.
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("redharvest_server=debug,info")),
        )
        .init();

    let cli = Cli::parse();
    let store_spec = StoreSpec::from_env();
    let storage: Arc<dyn Storage> = store_spec.open()?;
    let store_env = store_spec.as_env_value()?;
    if !store_spec.is_shared_across_processes() {
        warn!(
            "memory store selected: spawned workers get their own store \
             and will not observe control-plane state (test mode only)"
        );
    }
    info!(store = %store_env, "store backend resolved");

    let sealer = Sealer::from_env()?;
    let supervisor = Arc::new(Supervisor::new(storage.clone(), sealer.clone(), store_env));

    tokio::spawn(supervisor.clone().monitor());

    let app = router::app_router(AppState::new(storage, supervisor, sealer));
    let addr = format!("{}:{}", cli.bind, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "control plane listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

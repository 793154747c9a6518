mod seed;

use std::sync::Arc;

use anyhow::Result;
use axum::routing::any;
use axum::Router;
use clap::Parser;
use tracing::info;

use parley_core::logging;
use parley_core::radio::RadioCoordinator;
use parley_core::store::{
    ChannelStore, MemoryChannelStore, MemoryRadioStore, MemoryUserStore, RadioStore, UserStore,
};
use parley_core::Config;
use parley_gateway::{ws_handler, Gateway, Hub};
use parley_sfu::Sfu;

#[derive(Parser)]
#[command(name = "parley", version, about = "Self-hosted group communication server")]
struct Cli {
    /// Config file path; environment variables (PARLEY_*) take precedence
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<String>,

    /// JSON seed file with users, channels, and the radio catalog
    #[arg(long, env = "PARLEY_SEED")]
    seed: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    logging::init_logging(&config.logging)?;
    info!("parley server starting");

    let users = Arc::new(MemoryUserStore::new());
    let channels = Arc::new(MemoryChannelStore::new());
    let radio_store = Arc::new(MemoryRadioStore::new());
    if let Some(path) = cli.seed.as_deref() {
        seed::apply(seed::load(path)?, &users, &channels, &radio_store);
    }

    let sfu = Sfu::new(&config.webrtc)?;
    let radio = Arc::new(RadioCoordinator::new(
        Arc::clone(&radio_store) as Arc<dyn RadioStore>
    ));

    let (hub, handle) = Hub::new(Arc::clone(&sfu), Arc::clone(&radio));
    sfu.set_signal_sink(Arc::new(handle.clone()));
    radio.set_broadcaster(Arc::new(handle.clone()));
    tokio::spawn(hub.run());

    let gateway = Gateway::new(
        handle,
        sfu,
        radio,
        users as Arc<dyn UserStore>,
        channels as Arc<dyn ChannelStore>,
        radio_store as Arc<dyn RadioStore>,
        config.session.clone(),
    );

    let app = Router::new()
        .route("/ws", any(ws_handler))
        .with_state(gateway);

    let address = config.http_address();
    info!(address = %address, "listening");
    let listener = tokio::net::TcpListener::bind(&address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

mod api;
mod constants;
mod tally;

use api::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use constants::{CORS_MAX_AGE_SECS, DEFAULT_MINE_TIMEOUT_SECS};
use sealchain_core::constants::DEFAULT_DIFFICULTY;
use sealchain_storage::{sled_store::SledStore, Integrity, SnapshotStore};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, Level};

#[derive(Parser, Debug)]
struct Args {
    /// Address to listen on, e.g. 127.0.0.1:8080
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Data directory for sled
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Leading zero hex characters a mined block hash needs
    #[arg(long, default_value_t = DEFAULT_DIFFICULTY)]
    difficulty: u32,

    /// Give up on a proof-of-work search after this many seconds
    #[arg(long, default_value_t = DEFAULT_MINE_TIMEOUT_SECS)]
    mine_timeout_secs: u64,

    /// Rehash and relink every stored chain before using it
    #[arg(long)]
    verify_on_load: bool,
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(CORS_MAX_AGE_SECS));

    Router::new()
        .route("/health", get(api::health))
        .route("/entities", get(api::list_entities).post(api::create_entity))
        .route("/entities/{id}", get(api::get_entity).delete(api::purge_entity))
        .route("/entities/{id}/chain", get(api::get_chain))
        .route("/entities/{id}/sign", post(api::sign))
        .route("/entities/{id}/verify", get(api::verify))
        .route("/entities/{id}/tally", get(api::get_tally))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let store = Arc::new(SledStore::open(&args.data_dir)?);
    let integrity = if args.verify_on_load {
        Integrity::Verified {
            difficulty: args.difficulty,
        }
    } else {
        Integrity::Trusted
    };

    let state = AppState {
        store: Arc::clone(&store),
        difficulty: args.difficulty,
        mine_timeout: Duration::from_secs(args.mine_timeout_secs),
        integrity,
    };

    let addr: SocketAddr = args.listen.parse()?;
    info!(
        difficulty = args.difficulty,
        ?integrity,
        "sealchain-node listening on http://{addr}"
    );
    axum::serve(tokio::net::TcpListener::bind(addr).await?, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    store.close()?;
    Ok(())
}

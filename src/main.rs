//! resource-tree-handler service binary
//!
//! Wires the cache owner, the worker pool, the SSE client and the HTTP
//! surface together and serves until terminated.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use resource_tree_handler::cache::TreeCache;
use resource_tree_handler::config::{Config, DebugLevel};
use resource_tree_handler::dispatch::{Dispatcher, Regulator};
use resource_tree_handler::kube as cluster;
use resource_tree_handler::sse::SseClient;
use resource_tree_handler::web::{self, AppState};

/// Serves live resource trees for Krateo compositions
#[derive(Parser, Debug)]
#[command(name = "resource-tree-handler")]
#[command(about = "Serves live resource trees for Krateo compositions", long_about = None)]
struct Args {
    /// Force debug logging regardless of DEBUG_LEVEL
    #[arg(long, short = 'd')]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_env().context("configuration missing")?;
    let level = if args.debug {
        DebugLevel::Debug
    } else {
        config.debug_level
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.as_filter())),
        )
        .with_target(true)
        .init();

    if level.is_debug() {
        tracing::debug!("list of environment variables:");
        for (key, value) in std::env::vars() {
            tracing::debug!("{}={}", key, value);
        }
    }

    let client = cluster::create_client().await?;

    let cache = TreeCache::new();
    let regulator = Arc::new(Regulator::new());
    let dispatcher = Dispatcher::spawn(client.clone(), cache.clone(), regulator.clone());

    tracing::info!("starting SSE client on {}", config.sse_url);
    let sse = SseClient::new(config.sse_url.clone(), client.clone(), cache.clone());
    let _sse_task = sse.spinup();

    let app = web::router(AppState {
        client,
        cache,
        regulator,
        dispatcher,
        sse,
    });
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("serving resource trees on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, app).await.context("serving HTTP")?;

    Ok(())
}

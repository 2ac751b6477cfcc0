// src/main.rs
use anyhow::Context;
use clap::Parser;
use roomview::{build_router, config::Config, init_tracing, setup_shared_state, spawn_background_tasks};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(Config::parse());
    info!("roomview starting ({:?})", config);

    let server_state = setup_shared_state(config.clone()).await?;
    spawn_background_tasks(&server_state);
    let app = build_router(server_state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("🚀 Rust server is running at http://{}{}/", addr, config.route_prefix());

    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}

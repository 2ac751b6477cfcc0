// src/lib.rs
pub mod cache_manager;
pub mod client_pool;
pub mod config;
pub mod error;
pub mod http_handlers;
pub mod mxc;
pub mod mxclient;
pub mod pagination;
pub mod public_rooms;
pub mod room;
pub mod room_state;
pub mod state;
pub mod timeline;
pub mod types;
pub mod worker;

use anyhow::Context;
use axum::{routing::get, Router};
use client_pool::ClientPool;
use config::{Config, HomeserverConfig};
use mxclient::{HttpMatrixClient, MatrixApi};
use public_rooms::WorldReadableRooms;
use room::RoomContext;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker::WorkerPool;

const DIRECTORY_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub api: Arc<dyn MatrixApi>,
    pub workers: WorkerPool,
    pub directory: WorldReadableRooms,
    pub alias_cache: state::AliasCache,
    /// Normalised serve prefix, `""` when serving from the root.
    pub prefix: String,
}

impl ServerState {
    /// Spawns the worker pool; needs a running tokio runtime.
    pub fn new(config: Arc<Config>, api: Arc<dyn MatrixApi>, media_base: &str) -> Self {
        let ctx = Arc::new(RoomContext::new(api.clone(), media_base));
        let workers = WorkerPool::new(config.num_workers, config.worker_queue_depth, ctx);
        Self {
            prefix: config.route_prefix(),
            directory: WorldReadableRooms::new(api.clone(), media_base),
            alias_cache: state::new_alias_cache(),
            workers,
            api,
            config,
        }
    }
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomview=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Reads the homeserver config, builds the API client and worker pool, and
/// loads the room directory once.
pub async fn setup_shared_state(config: Arc<Config>) -> anyhow::Result<ServerState> {
    let homeserver = HomeserverConfig::load(&config.config_file)?;
    info!(
        "🏠 Homeserver: {} (as {}), media from {}",
        homeserver.home_server,
        if homeserver.user_id.is_empty() { "guest" } else { &homeserver.user_id },
        homeserver.media_base_url
    );

    let pool = ClientPool::new(config.http_pool_size, config.proxy_url.clone(), "HS");
    let client = HttpMatrixClient::new(&homeserver.home_server, Some(homeserver.access_token.clone()), pool)
        .with_context(|| format!("Unusable homeserver URL {}", homeserver.home_server))?;
    let api: Arc<dyn MatrixApi> = Arc::new(client);

    let state = ServerState::new(config, api, &homeserver.media_base_url);
    state.directory.load(DIRECTORY_RETRY_DELAY).await;
    Ok(state)
}

/// Periodic cache sweep and directory refresh.
pub fn spawn_background_tasks(state: &ServerState) {
    tokio::spawn(cache_manager::cache_manager_task(
        state.workers.clone(),
        state.config.sweep_settings(),
    ));
    tokio::spawn(public_rooms::directory_refresh_task(
        state.directory.clone(),
        state.config.directory_refresh(),
    ));
}

pub fn build_router(state: ServerState) -> Router {
    let routes = Router::new()
        .route("/", get(http_handlers::directory_handler))
        .route("/alias/{alias}", get(http_handlers::alias_handler))
        .route("/room/{room_id}", get(http_handlers::room_events_handler))
        .route("/room/{room_id}/event/{event_id}", get(http_handlers::permalink_handler))
        .route("/room/{room_id}/members", get(http_handlers::room_members_handler))
        .route("/room/{room_id}/members/{user_id}", get(http_handlers::room_member_info_handler))
        .route("/room/{room_id}/servers", get(http_handlers::room_servers_handler))
        .route("/room/{room_id}/aliases", get(http_handlers::room_aliases_handler))
        .route("/room/{room_id}/power_levels", get(http_handlers::room_power_levels_handler));

    let app = if state.prefix.is_empty() {
        routes
    } else {
        Router::new().nest(&state.prefix, routes)
    };

    app.with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mxclient::fake::{state_event, FakeHomeserver};
    use axum::body::{to_bytes, Body};
    use clap::Parser;
    use http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const ROOM: &str = "!rust:hs.one";

    fn homeserver() -> Arc<FakeHomeserver> {
        let hs = Arc::new(FakeHomeserver::new());
        hs.add_room(
            ROOM,
            50,
            vec![
                state_event("m.room.name", "", json!({ "name": "Rust" })),
                state_event("m.room.member", "@alice:hs.one", json!({ "membership": "join" })),
                state_event("m.room.aliases", "hs.one", json!({ "aliases": ["#rust:hs.one"] })),
            ],
        );
        hs.add_alias("#rust:hs.one", ROOM);
        hs
    }

    fn app_with(hs: Arc<FakeHomeserver>, args: &[&str]) -> Router {
        let config = Arc::new(Config::parse_from(
            ["roomview", "--num-workers", "4"].iter().chain(args.iter()).copied(),
        ));
        build_router(ServerState::new(config, hs, "https://hs.one"))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, http::HeaderMap, Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    #[tokio::test]
    async fn events_page_is_served_oldest_first() {
        let app = app_with(homeserver(), &[]);
        let (status, _, body) = get(app, "/room/!rust:hs.one").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["room_info"]["name"], "Rust");
        let events = body["events"].as_array().unwrap();
        assert_eq!(events.len(), 30);
        assert_eq!(events[29]["event_id"], "$e49:!rust:hs.one");
        assert_eq!(body["anchor"], "$e49:!rust:hs.one");
        assert_eq!(body["at_bottom_end"], true);
    }

    #[tokio::test]
    async fn room_ids_are_validated_and_refusals_mapped() {
        let hs = homeserver();
        let (status, _, body) = get(app_with(hs.clone(), &[]), "/room/rust:hs.one/members").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Unable to Load Room.");

        let (status, _, _) = get(app_with(hs.clone(), &[]), "/room/!secret:hs.one").await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        hs.set_failing(true);
        let (status, _, _) = get(app_with(hs, &[]), "/room/!rust:hs.one").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn member_routes_page_and_look_up() {
        let app = app_with(homeserver(), &[]);

        let (status, _, body) = get(app.clone(), "/room/!rust:hs.one/members?page=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["members"][0]["user_id"], "@alice:hs.one");
        assert_eq!(body["page_size"], 20);

        let (status, _, body) = get(app.clone(), "/room/!rust:hs.one/members/@alice:hs.one").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["member"]["membership"], "join");
        assert_eq!(body["role"], "User");

        let (status, _, _) = get(app.clone(), "/room/!rust:hs.one/members/@nobody:hs.one").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, body) = get(app.clone(), "/room/!rust:hs.one/aliases").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["aliases"][0]["server_name"], "hs.one");

        let (status, _, body) = get(app, "/room/!rust:hs.one/servers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["servers"][0]["num_users"], 1);
    }

    #[tokio::test]
    async fn aliases_and_permalinks_redirect() {
        let app = app_with(homeserver(), &["--public-serve-prefix", "/view/"]);

        let (status, headers, _) = get(app.clone(), "/view/alias/%23rust:hs.one").await;
        assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(headers[header::LOCATION], "/view/room/%21rust%3Ahs.one");

        let (status, _, _) = get(app.clone(), "/view/alias/%23nope:hs.one").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, headers, _) = get(app.clone(), "/view/room/!rust:hs.one/event/$e3:hs.one").await;
        assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            headers[header::LOCATION],
            "/view/room/%21rust%3Ahs.one?anchor=%24e3%3Ahs.one&offset=-10&highlight=%24e3%3Ahs.one"
        );

        let (status, _, body) = get(app, "/view/room/!rust:hs.one/power_levels").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["room_info"]["room_id"], ROOM);
    }
}

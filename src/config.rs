// src/config.rs
use crate::{cache_manager::SweepSettings, worker};
use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Read-only web view of public Matrix rooms.
#[derive(Debug, Clone, Parser)]
#[command(name = "roomview", version, about)]
pub struct Config {
    /// JSON file with the homeserver URL and credentials
    #[arg(long, env = "ROOMVIEW_CONFIG_FILE", default_value = "./config.json")]
    pub config_file: PathBuf,

    /// Number of room cache workers
    #[arg(long, env = "ROOMVIEW_NUM_WORKERS", default_value_t = worker::DEFAULT_NUM_WORKERS)]
    pub num_workers: usize,

    /// Jobs each worker queues before callers wait
    #[arg(long, env = "ROOMVIEW_WORKER_QUEUE_DEPTH", default_value_t = worker::DEFAULT_QUEUE_DEPTH)]
    pub worker_queue_depth: usize,

    /// Idle time after which a cached room may be evicted
    #[arg(long, env = "ROOMVIEW_CACHE_TTL_SECS", default_value_t = 1800)]
    pub cache_ttl_secs: u64,

    /// Most recently used rooms each worker always keeps
    #[arg(long, env = "ROOMVIEW_CACHE_MIN_ROOMS", default_value_t = 10)]
    pub cache_min_rooms: usize,

    #[arg(long, env = "ROOMVIEW_SWEEP_INTERVAL_SECS", default_value_t = 120)]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "ROOMVIEW_DIRECTORY_REFRESH_SECS", default_value_t = 3600)]
    pub directory_refresh_secs: u64,

    /// Listen address. `PORT` alone binds 0.0.0.0:$PORT.
    #[arg(long, env = "ROOMVIEW_BIND")]
    pub bind: Option<String>,

    /// Path prefix every route is served under
    #[arg(long, env = "ROOMVIEW_PUBLIC_SERVE_PREFIX", default_value = "/")]
    pub public_serve_prefix: String,

    /// HTTP clients kept for talking to the homeserver
    #[arg(long, env = "ROOMVIEW_HTTP_POOL_SIZE", default_value_t = 8)]
    pub http_pool_size: usize,

    #[arg(long, env = "ROOMVIEW_PROXY_URL")]
    pub proxy_url: Option<String>,
}

impl Config {
    pub fn bind_addr(&self) -> String {
        if let Some(bind) = &self.bind {
            return bind.clone();
        }
        let port = std::env::var("PORT").unwrap_or_else(|_| "8000".to_string());
        format!("0.0.0.0:{}", port)
    }

    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            ttl: Duration::from_secs(self.cache_ttl_secs),
            keep_min: self.cache_min_rooms,
        }
    }

    pub fn directory_refresh(&self) -> Duration {
        Duration::from_secs(self.directory_refresh_secs.max(1))
    }

    /// The serve prefix as a nestable path: `""` for the root, else `/x` with no trailing slash.
    pub fn route_prefix(&self) -> String {
        let trimmed = self.public_serve_prefix.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        }
    }
}

/// Contents of the JSON config file.
#[derive(Debug, Clone, Deserialize)]
pub struct HomeserverConfig {
    #[serde(rename = "HomeServer", alias = "home_server")]
    pub home_server: String,
    #[serde(rename = "UserID", alias = "user_id", default)]
    pub user_id: String,
    #[serde(rename = "AccessToken", alias = "access_token", default)]
    pub access_token: String,
    #[serde(rename = "MediaBaseURL", alias = "media_base_url", default)]
    pub media_base_url: String,
}

impl HomeserverConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut config: HomeserverConfig = serde_json::from_str(raw)?;
        if config.home_server.trim().is_empty() {
            bail!("home_server must not be empty");
        }
        if config.media_base_url.trim().is_empty() {
            config.media_base_url = config.home_server.clone();
        }
        Ok(config)
    }
}

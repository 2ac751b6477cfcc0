// src/client_pool.rs

use reqwest::{Client, Proxy};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const USER_AGENT: &str = concat!("roomview/", env!("CARGO_PKG_VERSION"));

/// A fixed set of HTTP clients handed out round-robin. A client that hits a
/// connection-level failure is rebuilt in place so the next request gets a
/// fresh connection.
#[derive(Clone)]
pub struct ClientPool {
    clients: Arc<RwLock<Vec<Client>>>,
    proxy_url: Option<String>,
    max_size: usize,
    counter: Arc<AtomicUsize>,
    name: String,
}

impl ClientPool {
    pub fn new(size: usize, proxy_url: Option<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let size = size.max(1);

        info!(
            "🏊 [POOL:{}] Initializing with {} clients. Mode: {}",
            name,
            size,
            if proxy_url.is_some() { "PROXY" } else { "DIRECT" }
        );

        let clients = (0..size)
            .map(|index| build_client(proxy_url.as_deref(), index, &name))
            .collect();

        Self {
            clients: Arc::new(RwLock::new(clients)),
            proxy_url,
            max_size: size,
            counter: Arc::new(AtomicUsize::new(0)),
            name,
        }
    }

    /// Next client and its index (the index is what `recycle_client` takes).
    pub async fn get_client(&self) -> (usize, Client) {
        let current = self.counter.fetch_add(1, Ordering::Relaxed);
        let index = current % self.max_size;

        let read_lock = self.clients.read().await;
        (index, read_lock[index].clone())
    }

    /// Replaces the client at `index` with a freshly built one.
    pub async fn recycle_client(&self, index: usize) -> Client {
        warn!("♻️ [POOL:{}] Recycling Client #{}", self.name, index);

        let new_client = build_client(self.proxy_url.as_deref(), index, &self.name);

        let mut write_lock = self.clients.write().await;
        write_lock[index] = new_client.clone();

        info!("✅ [POOL:{}] Client #{} refreshed and ready.", self.name, index);
        new_client
    }

    pub fn size(&self) -> usize {
        self.max_size
    }
}

/// If a proxy is configured but unusable, fall back to a client routed to an
/// unreachable proxy instead of silently connecting directly.
fn build_safe_fallback(proxy_url: Option<&str>) -> Client {
    if proxy_url.is_some() {
        Proxy::all("http://0.0.0.0:1")
            .and_then(|broken| Client::builder().proxy(broken).build())
            .unwrap_or_else(|_| Client::new())
    } else {
        Client::new()
    }
}

fn build_client(proxy_url: Option<&str>, index: usize, pool_name: &str) -> Client {
    let mut builder = Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(Duration::from_secs(90))
        .user_agent(USER_AGENT);

    if let Some(url) = proxy_url {
        match Proxy::all(url) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(e) => {
                error!("❌ [POOL:{}] Invalid Proxy URL: {}", pool_name, e);
                return build_safe_fallback(proxy_url);
            }
        }
    }

    match builder.build() {
        Ok(client) => client,
        Err(e) => {
            error!("❌ [POOL:{}] Client #{} build failed: {}", pool_name, index, e);
            build_safe_fallback(proxy_url)
        }
    }
}

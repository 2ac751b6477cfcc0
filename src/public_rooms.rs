// src/public_rooms.rs
use crate::{
    error::ApiError,
    mxc,
    mxclient::MatrixApi,
    pagination::page_bounds,
    types::PublicRoom,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{error, info, warn};

const AVATAR_SIZE: u32 = 60;
const INITIAL_LOAD_ATTEMPTS: usize = 3;

/// World-readable rooms from the homeserver's public directory.
#[derive(Clone)]
pub struct WorldReadableRooms {
    api: Arc<dyn MatrixApi>,
    media_base: String,
    rooms: Arc<RwLock<Vec<PublicRoom>>>,
}

/// Keeps world-readable rooms only, fills in a primary alias, and turns avatar
/// mxc URIs into thumbnail URLs.
fn process_directory(media_base: &str, chunk: Vec<PublicRoom>) -> Vec<PublicRoom> {
    chunk
        .into_iter()
        .filter(|room| room.world_readable)
        .map(|mut room| {
            if room.canonical_alias.as_deref().map_or(true, str::is_empty) {
                room.canonical_alias = room.aliases.first().cloned();
            }
            room.avatar_url = room
                .avatar_url
                .as_deref()
                .and_then(|url| mxc::thumbnail_url(url, media_base, AVATAR_SIZE, AVATAR_SIZE, "crop"));
            room
        })
        .collect()
}

fn matches(room: &PublicRoom, query: &str) -> bool {
    let contains = |field: &Option<String>| {
        field
            .as_deref()
            .is_some_and(|value| value.to_lowercase().contains(query))
    };
    (query.starts_with('#') && contains(&room.canonical_alias)) || contains(&room.name) || contains(&room.topic)
}

impl WorldReadableRooms {
    /// Starts with an empty directory; call `update` or `load` to fill it.
    pub fn new(api: Arc<dyn MatrixApi>, media_base: impl Into<String>) -> Self {
        Self {
            api,
            media_base: media_base.into(),
            rooms: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Replaces the snapshot. On error the previous snapshot stays.
    pub async fn update(&self) -> Result<usize, ApiError> {
        let resp = self.api.public_rooms().await?;
        let rooms = process_directory(&self.media_base, resp.chunk);
        let count = rooms.len();
        *self.rooms.write().await = rooms;
        Ok(count)
    }

    /// First load, retried with backoff. Gives up with an empty directory.
    pub async fn load(&self, first_delay: Duration) -> usize {
        let factor = (first_delay.as_millis() as u64 / 2).max(1);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(factor)
            .map(jitter)
            .take(INITIAL_LOAD_ATTEMPTS - 1);

        let directory = self;
        match Retry::start(strategy, move || async move {
            directory
                .update()
                .await
                .inspect_err(|e| warn!("⚠️ [DIRECTORY] Load attempt failed: {}", e))
        })
        .await
        {
            Ok(count) => {
                info!("📚 [DIRECTORY] Loaded {} world readable rooms", count);
                count
            }
            Err(e) => {
                error!("❌ [DIRECTORY] Giving up, starting empty: {}", e);
                0
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn get_page(&self, page: usize, page_size: usize) -> Vec<PublicRoom> {
        let rooms = self.rooms.read().await;
        rooms[page_bounds(page, page_size, rooms.len())].to_vec()
    }

    /// Case-insensitive search on name and topic, plus canonical alias when
    /// the query starts with `#`.
    pub async fn get_filtered_page(&self, page: usize, page_size: usize, query: &str) -> Vec<PublicRoom> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return self.get_page(page, page_size).await;
        }
        let rooms = self.rooms.read().await;
        let found: Vec<&PublicRoom> = rooms.iter().filter(|room| matches(room, &query)).collect();
        found[page_bounds(page, page_size, found.len())]
            .iter()
            .map(|room| (*room).clone())
            .collect()
    }
}

/// Refreshes the directory every `every`, keeping the old snapshot on failure.
pub async fn directory_refresh_task(directory: WorldReadableRooms, every: Duration) {
    let mut timer = interval_at(Instant::now() + every, every);
    loop {
        timer.tick().await;
        match directory.update().await {
            Ok(count) => info!("📚 [DIRECTORY] Refreshed, {} world readable rooms", count),
            Err(e) => warn!("[DIRECTORY] Refresh failed, keeping previous list: {}", e),
        }
    }
}

// src/state.rs
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const ALIAS_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct CachedAlias {
    pub room_id: String,
    pub resolved_at: Instant,
}

// Room alias -> resolved room id
pub type AliasCache = Arc<DashMap<String, CachedAlias>>;

pub fn new_alias_cache() -> AliasCache {
    Arc::new(DashMap::new())
}

/// Cached resolution of `alias`, if younger than `ttl`. Expired entries are dropped.
pub fn lookup_alias(cache: &AliasCache, alias: &str, ttl: Duration) -> Option<String> {
    let expired = match cache.get(alias) {
        Some(entry) if entry.resolved_at.elapsed() < ttl => return Some(entry.room_id.clone()),
        Some(_) => true,
        None => false,
    };
    if expired {
        cache.remove(alias);
    }
    None
}

pub fn remember_alias(cache: &AliasCache, alias: &str, room_id: &str) {
    cache.insert(
        alias.to_owned(),
        CachedAlias {
            room_id: room_id.to_owned(),
            resolved_at: Instant::now(),
        },
    );
}

// src/room.rs
use crate::{
    error::RoomError,
    mxc,
    mxclient::MatrixApi,
    room_state::RoomState,
    timeline::{EventPage, Timeline},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_INITIAL_SYNC_LIMIT: usize = 256;

/// Everything a room needs from the outside world, shared by all workers.
pub struct RoomContext {
    pub api: Arc<dyn MatrixApi>,
    pub initial_sync_limit: usize,
    /// Host that `mxc://` avatars are downloaded from.
    pub media_base: String,
}

impl RoomContext {
    pub fn new(api: Arc<dyn MatrixApi>, media_base: impl Into<String>) -> Self {
        Self {
            api,
            initial_sync_limit: DEFAULT_INITIAL_SYNC_LIMIT,
            media_base: media_base.into(),
        }
    }
}

/// Header data every room page renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub name: String,
    pub canonical_alias: Option<String>,
    pub topic: Option<String>,
    pub avatar_url: Option<String>,
    pub num_member_events: usize,
    pub num_members: usize,
    pub num_servers: usize,
}

pub struct Room {
    id: String,
    ctx: Arc<RoomContext>,
    timeline: Timeline,
    state: RoomState,
    last_access: DateTime<Utc>,
}

impl Room {
    /// Loads a room with one initial sync. State is folded from the sync's
    /// state snapshot, the timeline is seeded with its message chunk.
    pub async fn new(ctx: Arc<RoomContext>, room_id: &str) -> Result<Room, RoomError> {
        let resp = ctx
            .api
            .room_initial_sync(room_id, ctx.initial_sync_limit)
            .await
            .map_err(|e| {
                warn!("❌ [ROOM {}] Initial sync failed: {}", room_id, e);
                RoomError::from_api(room_id, e)
            })?;

        let mut state = RoomState::new();
        state.apply(&resp.state, false);
        state.recalculate();

        let messages = resp.messages;
        let timeline = Timeline::new(
            messages.chunk,
            messages.start.unwrap_or_default(),
            messages.end.unwrap_or_default(),
        );

        info!(
            "🏠 [ROOM {}] Loaded: {} events buffered, {} members",
            room_id,
            timeline.len(),
            state.num_members()
        );

        Ok(Room {
            id: room_id.to_owned(),
            ctx,
            timeline,
            state,
            last_access: Utc::now(),
        })
    }

    pub fn room_info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.id.clone(),
            name: self.state.calculate_name(),
            canonical_alias: self.state.canonical_alias.clone(),
            topic: self.state.topic.clone(),
            avatar_url: self
                .state
                .avatar_url
                .as_deref()
                .and_then(|url| mxc::download_url(url, &self.ctx.media_base)),
            num_member_events: self.state.num_member_events(),
            num_members: self.state.num_members(),
            num_servers: self.state.servers().len(),
        }
    }

    pub fn access(&mut self) {
        self.last_access = Utc::now();
    }

    pub fn last_access(&self) -> DateTime<Utc> {
        self.last_access
    }

    #[cfg(test)]
    pub(crate) fn set_last_access(&mut self, at: DateTime<Utc>) {
        self.last_access = at;
    }

    pub fn state(&self) -> &RoomState {
        &self.state
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn historic_end_reached(&self) -> bool {
        self.timeline.historic_end_reached()
    }

    pub async fn get_event_page(&mut self, anchor: &str, offset: i64, page_size: usize) -> Result<EventPage, RoomError> {
        let page = self
            .timeline
            .get_page(self.ctx.api.as_ref(), &self.id, anchor, offset, page_size)
            .await;
        self.access();
        page
    }

    /// Pulls live events. Does not count as an access.
    pub async fn forward_paginate(&mut self) -> Result<usize, RoomError> {
        self.timeline
            .forward_paginate(self.ctx.api.as_ref(), &self.id, &mut self.state)
            .await
            .map_err(|e| RoomError::from_api(&self.id, e))
    }
}

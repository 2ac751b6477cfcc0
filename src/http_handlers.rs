// src/http_handlers.rs
use super::{
    error::AppError,
    room::RoomInfo,
    room_state::MemberInfo,
    state::{self, ALIAS_CACHE_TTL},
    types::{DirectoryQuery, Event, EventsQuery, PageQuery, PublicRoom},
    worker::{RoomAliasesResp, RoomMemberInfoResp, RoomMembersResp, RoomPowerLevelsResp, RoomServersResp},
    ServerState,
};
use axum::{
    extract::{Path, Query, State},
    response::{Json as AxumJson, Redirect},
};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

pub const DIRECTORY_PAGE_SIZE: usize = 20;
pub const TIMELINE_PAGE_SIZE: usize = 30;
pub const MEMBERS_PAGE_SIZE: usize = 20;
pub const SERVERS_PAGE_SIZE: usize = 30;
pub const ALIASES_PAGE_SIZE: usize = 10;
/// How far back from a permalinked event its page starts.
pub const PERMALINK_OFFSET: i64 = 10;

#[derive(Debug, Serialize)]
pub struct DirectoryPage {
    pub rooms: Vec<PublicRoom>,
    pub page: usize,
    pub page_size: usize,
    pub query: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RoomChatPage {
    pub room_info: RoomInfo,
    pub member_map: HashMap<String, MemberInfo>,
    /// Oldest first, ready to render top to bottom.
    pub events: Vec<Event>,
    pub page_size: usize,
    pub current_offset: i64,
    pub anchor: String,
    pub highlight: Option<String>,
    pub at_top_end: bool,
    pub at_bottom_end: bool,
}

/// Link to a room page; the id is percent-encoded so any id makes a valid `Location`.
fn room_path(prefix: &str, room_id: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(room_id.as_bytes()).collect();
    format!("{}/room/{}", prefix, encoded)
}

fn page_or_first(page: Option<usize>) -> usize {
    page.unwrap_or(1)
}

/// Validates the id and makes sure its worker has the room cached.
async fn load_room(state: &ServerState, room_id: &str) -> Result<(), AppError> {
    if !room_id.starts_with('!') {
        return Err(AppError::InvalidRoomId(room_id.to_owned()));
    }
    state.workers.initial_sync(room_id).await?;
    Ok(())
}

pub async fn directory_handler(
    State(state): State<ServerState>,
    Query(query): Query<DirectoryQuery>,
) -> AxumJson<DirectoryPage> {
    let page = page_or_first(query.page);
    let rooms = match query.q.as_deref() {
        Some(q) => state.directory.get_filtered_page(page, DIRECTORY_PAGE_SIZE, q).await,
        None => state.directory.get_page(page, DIRECTORY_PAGE_SIZE).await,
    };
    AxumJson(DirectoryPage {
        rooms,
        page,
        page_size: DIRECTORY_PAGE_SIZE,
        query: query.q,
    })
}

pub async fn alias_handler(
    State(state): State<ServerState>,
    Path(alias): Path<String>,
) -> Result<Redirect, AppError> {
    let room_id = match state::lookup_alias(&state.alias_cache, &alias, ALIAS_CACHE_TTL) {
        Some(room_id) => room_id,
        None => {
            let resp = state
                .api
                .resolve_room_alias(&alias)
                .await
                .map_err(|e| AppError::AliasNotFound {
                    alias: alias.clone(),
                    reason: e.describe(),
                })?;
            if resp.room_id.is_empty() {
                return Err(AppError::AliasNotFound {
                    alias,
                    reason: "The homeserver returned no room".to_string(),
                });
            }
            info!("🔗 [ALIAS] {} -> {}", alias, resp.room_id);
            state::remember_alias(&state.alias_cache, &alias, &resp.room_id);
            resp.room_id
        }
    };
    Ok(Redirect::temporary(&room_path(&state.prefix, &room_id)))
}

pub async fn room_events_handler(
    State(state): State<ServerState>,
    Path(room_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<AxumJson<RoomChatPage>, AppError> {
    load_room(&state, &room_id).await?;

    let offset = query.offset.unwrap_or(0);
    let mut anchor = query.anchor.unwrap_or_default();
    let resp = state
        .workers
        .events_page(&room_id, &anchor, offset, TIMELINE_PAGE_SIZE)
        .await?;

    if anchor.is_empty() {
        if let Some(newest) = resp.events.first() {
            anchor = newest.event_id.clone();
        }
    }
    debug!("[ROOM {}] Served {} events at offset {}", room_id, resp.events.len(), offset);

    let mut events = resp.events;
    events.reverse();
    Ok(AxumJson(RoomChatPage {
        room_info: resp.room_info,
        member_map: resp.member_map,
        events,
        page_size: TIMELINE_PAGE_SIZE,
        current_offset: offset,
        anchor,
        highlight: query.highlight,
        at_top_end: resp.at_top_end,
        at_bottom_end: resp.at_bottom_end,
    }))
}

/// Permalinks land on a page with the event a little below the top.
pub async fn permalink_handler(
    State(state): State<ServerState>,
    Path((room_id, event_id)): Path<(String, String)>,
) -> Redirect {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("anchor", &event_id)
        .append_pair("offset", &(-PERMALINK_OFFSET).to_string())
        .append_pair("highlight", &event_id)
        .finish();
    Redirect::temporary(&format!("{}?{}", room_path(&state.prefix, &room_id), query))
}

pub async fn room_members_handler(
    State(state): State<ServerState>,
    Path(room_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<AxumJson<RoomMembersResp>, AppError> {
    load_room(&state, &room_id).await?;
    let resp = state
        .workers
        .members(&room_id, page_or_first(query.page), MEMBERS_PAGE_SIZE)
        .await?;
    Ok(AxumJson(resp))
}

pub async fn room_member_info_handler(
    State(state): State<ServerState>,
    Path((room_id, user_id)): Path<(String, String)>,
) -> Result<AxumJson<RoomMemberInfoResp>, AppError> {
    load_room(&state, &room_id).await?;
    Ok(AxumJson(state.workers.member_info(&room_id, &user_id).await?))
}

pub async fn room_servers_handler(
    State(state): State<ServerState>,
    Path(room_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<AxumJson<RoomServersResp>, AppError> {
    load_room(&state, &room_id).await?;
    let resp = state
        .workers
        .servers(&room_id, page_or_first(query.page), SERVERS_PAGE_SIZE)
        .await?;
    Ok(AxumJson(resp))
}

pub async fn room_aliases_handler(
    State(state): State<ServerState>,
    Path(room_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<AxumJson<RoomAliasesResp>, AppError> {
    load_room(&state, &room_id).await?;
    let resp = state
        .workers
        .aliases(&room_id, page_or_first(query.page), ALIASES_PAGE_SIZE)
        .await?;
    Ok(AxumJson(resp))
}

pub async fn room_power_levels_handler(
    State(state): State<ServerState>,
    Path(room_id): Path<String>,
) -> Result<AxumJson<RoomPowerLevelsResp>, AppError> {
    load_room(&state, &room_id).await?;
    Ok(AxumJson(state.workers.power_levels(&room_id).await?))
}

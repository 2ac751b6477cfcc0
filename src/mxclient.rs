// src/mxclient.rs
use crate::{
    client_pool::ClientPool,
    error::ApiError,
    types::{
        Direction, InitialSyncResponse, MatrixErrorBody, MessagesResponse, PublicRoomsResponse,
        RoomAliasResponse,
    },
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

/// The slice of the homeserver client-server API the front-end reads from.
#[async_trait]
pub trait MatrixApi: Send + Sync {
    /// `GET /rooms/{roomId}/initialSync`: current state plus the latest `limit` events.
    async fn room_initial_sync(&self, room_id: &str, limit: usize) -> Result<InitialSyncResponse, ApiError>;

    /// `GET /rooms/{roomId}/messages` starting at pagination token `from`.
    async fn room_messages(
        &self,
        room_id: &str,
        from: &str,
        direction: Direction,
        limit: usize,
    ) -> Result<MessagesResponse, ApiError>;

    async fn public_rooms(&self) -> Result<PublicRoomsResponse, ApiError>;

    async fn resolve_room_alias(&self, alias: &str) -> Result<RoomAliasResponse, ApiError>;
}

pub struct HttpMatrixClient {
    homeserver: Url,
    access_token: Option<String>,
    pool: ClientPool,
}

impl HttpMatrixClient {
    pub fn new(homeserver: &str, access_token: Option<String>, pool: ClientPool) -> Result<Self, ApiError> {
        let homeserver = Url::parse(homeserver)?;
        if homeserver.cannot_be_a_base() {
            return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase.into());
        }
        Ok(Self {
            homeserver,
            access_token: access_token.filter(|t| !t.is_empty()),
            pool,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.homeserver.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["_matrix", "client", "r0"])
                .extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        debug!("[MXCLIENT] GET {}", url.path());
        let (index, client) = self.pool.get_client().await;

        let mut request = client.get(url);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                // Connection-level failures poison the client, rebuild it.
                if e.is_connect() || e.is_timeout() {
                    self.pool.recycle_client(index).await;
                }
                return Err(e.into());
            }
        };

        let status = response.status();
        let body = response.bytes().await?;
        if status.is_success() {
            return Ok(serde_json::from_slice(&body)?);
        }

        match serde_json::from_slice::<MatrixErrorBody>(&body) {
            Ok(err) => Err(ApiError::Matrix {
                status,
                errcode: err.errcode,
                message: err.error,
            }),
            Err(_) => Err(ApiError::Http(status)),
        }
    }
}

#[async_trait]
impl MatrixApi for HttpMatrixClient {
    async fn room_initial_sync(&self, room_id: &str, limit: usize) -> Result<InitialSyncResponse, ApiError> {
        let mut url = self.endpoint(&["rooms", room_id, "initialSync"]);
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        self.get_json(url).await
    }

    async fn room_messages(
        &self,
        room_id: &str,
        from: &str,
        direction: Direction,
        limit: usize,
    ) -> Result<MessagesResponse, ApiError> {
        let mut url = self.endpoint(&["rooms", room_id, "messages"]);
        url.query_pairs_mut()
            .append_pair("from", from)
            .append_pair("dir", direction.as_str())
            .append_pair("limit", &limit.to_string());
        self.get_json(url).await
    }

    async fn public_rooms(&self) -> Result<PublicRoomsResponse, ApiError> {
        self.get_json(self.endpoint(&["publicRooms"])).await
    }

    async fn resolve_room_alias(&self, alias: &str) -> Result<RoomAliasResponse, ApiError> {
        self.get_json(self.endpoint(&["directory", "room", alias])).await
    }
}

/// In-memory homeserver used by unit tests. Pagination tokens are positions
/// (`t{n}`) into each room's chronological history.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::types::{Event, PublicRoom};
    use http::StatusCode;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeRoom {
        history: Vec<Event>,
        state: Vec<Event>,
    }

    #[derive(Default)]
    pub struct FakeHomeserver {
        rooms: Mutex<HashMap<String, FakeRoom>>,
        public: Mutex<Vec<PublicRoom>>,
        aliases: Mutex<HashMap<String, String>>,
        failing: AtomicBool,
        latency: Mutex<Duration>,
        pub initial_syncs: AtomicUsize,
        pub backward_calls: AtomicUsize,
        pub forward_calls: AtomicUsize,
    }

    pub fn message(room_id: &str, n: usize) -> Event {
        serde_json::from_value(json!({
            "event_id": format!("$e{}:{}", n, room_id),
            "type": "m.room.message",
            "sender": "@alice:hs.one",
            "content": { "msgtype": "m.text", "body": format!("message {}", n) },
            "origin_server_ts": n as i64,
        }))
        .unwrap()
    }

    pub fn state_event(event_type: &str, state_key: &str, content: Value) -> Event {
        serde_json::from_value(json!({
            "event_id": format!("${}:{}", event_type, state_key),
            "type": event_type,
            "sender": "@alice:hs.one",
            "state_key": state_key,
            "content": content,
        }))
        .unwrap()
    }

    pub fn redaction(n: usize) -> Event {
        serde_json::from_value(json!({
            "event_id": format!("$r{}", n),
            "type": "m.room.redaction",
            "sender": "@alice:hs.one",
            "redacts": "$e0",
            "content": {},
        }))
        .unwrap()
    }

    fn token(position: usize) -> String {
        format!("t{}", position)
    }

    fn parse_token(token: &str) -> usize {
        token.trim_start_matches('t').parse().unwrap_or(0)
    }

    impl FakeHomeserver {
        pub fn new() -> Self {
            Self::default()
        }

        /// Adds a room whose history holds `num_messages` messages, oldest first,
        /// ids `$e0..`, preceded by nothing. `state` is the current state.
        pub fn add_room(&self, room_id: &str, num_messages: usize, state: Vec<Event>) {
            let history = (0..num_messages).map(|n| message(room_id, n)).collect();
            self.rooms
                .lock()
                .unwrap()
                .insert(room_id.to_owned(), FakeRoom { history, state });
        }

        /// Appends a live event to the end of a room's history.
        pub fn push_event(&self, room_id: &str, event: Event) {
            let mut rooms = self.rooms.lock().unwrap();
            let room = rooms.get_mut(room_id).expect("unknown fake room");
            room.history.push(event);
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Delay applied to every `/messages` call.
        pub fn set_latency(&self, latency: Duration) {
            *self.latency.lock().unwrap() = latency;
        }

        pub fn add_public_room(&self, room: PublicRoom) {
            self.public.lock().unwrap().push(room);
        }

        pub fn add_alias(&self, alias: &str, room_id: &str) {
            self.aliases
                .lock()
                .unwrap()
                .insert(alias.to_owned(), room_id.to_owned());
        }

        fn check_failing(&self) -> Result<(), ApiError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ApiError::Http(StatusCode::BAD_GATEWAY));
            }
            Ok(())
        }
    }

    fn not_found() -> ApiError {
        ApiError::Matrix {
            status: StatusCode::FORBIDDEN,
            errcode: "M_FORBIDDEN".into(),
            message: "Guest access not allowed".into(),
        }
    }

    #[async_trait]
    impl MatrixApi for FakeHomeserver {
        async fn room_initial_sync(&self, room_id: &str, limit: usize) -> Result<InitialSyncResponse, ApiError> {
            self.check_failing()?;
            self.initial_syncs.fetch_add(1, Ordering::SeqCst);
            let rooms = self.rooms.lock().unwrap();
            let room = rooms.get(room_id).ok_or_else(not_found)?;
            let end = room.history.len();
            let start = end.saturating_sub(limit);
            Ok(InitialSyncResponse {
                messages: MessagesResponse {
                    chunk: room.history[start..end].to_vec(),
                    start: Some(token(start)),
                    end: Some(token(end)),
                },
                state: room.state.clone(),
            })
        }

        async fn room_messages(
            &self,
            room_id: &str,
            from: &str,
            direction: Direction,
            limit: usize,
        ) -> Result<MessagesResponse, ApiError> {
            self.check_failing()?;
            let latency = *self.latency.lock().unwrap();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let rooms = self.rooms.lock().unwrap();
            let room = rooms.get(room_id).ok_or_else(not_found)?;
            let position = parse_token(from).min(room.history.len());
            match direction {
                Direction::Backward => {
                    self.backward_calls.fetch_add(1, Ordering::SeqCst);
                    let start = position.saturating_sub(limit);
                    let chunk: Vec<Event> = room.history[start..position].iter().rev().cloned().collect();
                    let end = (!chunk.is_empty()).then(|| token(start));
                    Ok(MessagesResponse {
                        chunk,
                        start: Some(token(position)),
                        end,
                    })
                }
                Direction::Forward => {
                    self.forward_calls.fetch_add(1, Ordering::SeqCst);
                    let end = (position + limit).min(room.history.len());
                    Ok(MessagesResponse {
                        chunk: room.history[position..end].to_vec(),
                        start: Some(token(position)),
                        end: Some(token(end)),
                    })
                }
            }
        }

        async fn public_rooms(&self) -> Result<PublicRoomsResponse, ApiError> {
            self.check_failing()?;
            Ok(PublicRoomsResponse {
                chunk: self.public.lock().unwrap().clone(),
                ..Default::default()
            })
        }

        async fn resolve_room_alias(&self, alias: &str) -> Result<RoomAliasResponse, ApiError> {
            self.check_failing()?;
            match self.aliases.lock().unwrap().get(alias) {
                Some(room_id) => Ok(RoomAliasResponse {
                    room_id: room_id.clone(),
                    servers: vec![],
                }),
                None => Err(ApiError::Matrix {
                    status: StatusCode::NOT_FOUND,
                    errcode: "M_NOT_FOUND".into(),
                    message: "Room alias not found".into(),
                }),
            }
        }
    }
}

// src/types.rs

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ==============================================================================
// 1. Event types understood by the state projector
// ==============================================================================

pub const ROOM_CREATE: &str = "m.room.create";
pub const ROOM_NAME: &str = "m.room.name";
pub const ROOM_TOPIC: &str = "m.room.topic";
pub const ROOM_AVATAR: &str = "m.room.avatar";
pub const ROOM_CANONICAL_ALIAS: &str = "m.room.canonical_alias";
pub const ROOM_ALIASES: &str = "m.room.aliases";
pub const ROOM_MEMBER: &str = "m.room.member";
pub const ROOM_POWER_LEVELS: &str = "m.room.power_levels";
pub const ROOM_REDACTION: &str = "m.room.redaction";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CreateContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct NameContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TopicContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AvatarContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CanonicalAliasContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AliasesContent {
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MemberContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// The `m.room.power_levels` table. Missing keys default to zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PowerLevels {
    pub ban: i64,
    pub kick: i64,
    pub redact: i64,
    pub invite: i64,
    pub events_default: i64,
    pub state_default: i64,
    pub users_default: i64,
    pub events: BTreeMap<String, i64>,
    pub users: BTreeMap<String, i64>,
}

impl PowerLevels {
    pub fn user_level(&self, user_id: &str) -> i64 {
        self.users.get(user_id).copied().unwrap_or(self.users_default)
    }
}

/// Human readable role for a power level, as shown next to member names.
pub fn power_level_role(level: i64) -> &'static str {
    match level {
        100 => "Admin",
        50 => "Moderator",
        0 => "User",
        -1 => "Muted",
        _ => "Custom",
    }
}

// ==============================================================================
// 2. Event: content is a tagged union keyed by the event type
// ==============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum EventContent {
    Create(CreateContent),
    Name(NameContent),
    Topic(TopicContent),
    Avatar(AvatarContent),
    CanonicalAlias(CanonicalAliasContent),
    Aliases(AliasesContent),
    Member(MemberContent),
    PowerLevels(PowerLevels),
    Redaction(Value),
    // Messages and every other type pass through untouched.
    Other { event_type: String, content: Value },
}

fn typed<T: DeserializeOwned>(content: &Value) -> Option<T> {
    serde_json::from_value(content.clone()).ok()
}

impl EventContent {
    /// Parses a raw payload. A payload that does not fit the typed shape of its
    /// event type is kept as `Other`, so it is never applied to room state.
    pub fn parse(event_type: &str, content: Value) -> Self {
        let parsed = match event_type {
            ROOM_CREATE => typed(&content).map(EventContent::Create),
            ROOM_NAME => typed(&content).map(EventContent::Name),
            ROOM_TOPIC => typed(&content).map(EventContent::Topic),
            ROOM_AVATAR => typed(&content).map(EventContent::Avatar),
            ROOM_CANONICAL_ALIAS => typed(&content).map(EventContent::CanonicalAlias),
            ROOM_ALIASES => typed(&content).map(EventContent::Aliases),
            ROOM_MEMBER => typed(&content).map(EventContent::Member),
            ROOM_POWER_LEVELS => typed(&content).map(EventContent::PowerLevels),
            ROOM_REDACTION => return EventContent::Redaction(content),
            _ => None,
        };
        parsed.unwrap_or_else(|| EventContent::Other {
            event_type: event_type.to_owned(),
            content,
        })
    }

    pub fn event_type(&self) -> &str {
        match self {
            EventContent::Create(_) => ROOM_CREATE,
            EventContent::Name(_) => ROOM_NAME,
            EventContent::Topic(_) => ROOM_TOPIC,
            EventContent::Avatar(_) => ROOM_AVATAR,
            EventContent::CanonicalAlias(_) => ROOM_CANONICAL_ALIAS,
            EventContent::Aliases(_) => ROOM_ALIASES,
            EventContent::Member(_) => ROOM_MEMBER,
            EventContent::PowerLevels(_) => ROOM_POWER_LEVELS,
            EventContent::Redaction(_) => ROOM_REDACTION,
            EventContent::Other { event_type, .. } => event_type,
        }
    }

    fn to_value(&self) -> Value {
        let value = match self {
            EventContent::Create(c) => serde_json::to_value(c),
            EventContent::Name(c) => serde_json::to_value(c),
            EventContent::Topic(c) => serde_json::to_value(c),
            EventContent::Avatar(c) => serde_json::to_value(c),
            EventContent::CanonicalAlias(c) => serde_json::to_value(c),
            EventContent::Aliases(c) => serde_json::to_value(c),
            EventContent::Member(c) => serde_json::to_value(c),
            EventContent::PowerLevels(c) => serde_json::to_value(c),
            EventContent::Redaction(content) | EventContent::Other { content, .. } => {
                return content.clone()
            }
        };
        value.unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct Unsigned {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prev_content: Option<Value>,
}

// Shape of an event on the wire.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawEvent {
    event_id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state_key: Option<String>,
    #[serde(default)]
    content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prev_content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unsigned: Option<Unsigned>,
    #[serde(default)]
    origin_server_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(from = "RawEvent", into = "RawEvent")]
pub struct Event {
    pub event_id: String,
    pub sender: String,
    pub state_key: Option<String>,
    pub content: EventContent,
    pub prev_content: Option<Value>,
    pub origin_server_ts: i64,
}

impl From<RawEvent> for Event {
    fn from(raw: RawEvent) -> Self {
        let prev_content = raw
            .prev_content
            .or_else(|| raw.unsigned.and_then(|u| u.prev_content));
        Event {
            content: EventContent::parse(&raw.event_type, raw.content),
            event_id: raw.event_id,
            sender: raw.sender,
            state_key: raw.state_key,
            prev_content,
            origin_server_ts: raw.origin_server_ts,
        }
    }
}

impl From<Event> for RawEvent {
    fn from(event: Event) -> Self {
        RawEvent {
            event_type: event.content.event_type().to_owned(),
            content: event.content.to_value(),
            event_id: event.event_id,
            sender: event.sender,
            state_key: event.state_key,
            prev_content: event.prev_content,
            unsigned: None,
            origin_server_ts: event.origin_server_ts,
        }
    }
}

impl Event {
    pub fn event_type(&self) -> &str {
        self.content.event_type()
    }

    /// Redactions are already applied by the homeserver, so they never enter a timeline.
    pub fn is_redaction(&self) -> bool {
        matches!(self.content, EventContent::Redaction(_))
    }

    /// The previous membership payload of an `m.room.member` event, if any.
    pub fn prev_member_content(&self) -> Option<MemberContent> {
        match self.content {
            EventContent::Member(_) => self.prev_content.as_ref().and_then(typed),
            _ => None,
        }
    }
}

// ==============================================================================
// 3. Homeserver API responses
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Backward,
    Forward,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Backward => "b",
            Direction::Forward => "f",
        }
    }
}

/// Response of `/rooms/{roomId}/messages`. `end` is absent once there is nothing further.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub chunk: Vec<Event>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

/// The parts of `/rooms/{roomId}/initialSync` the cache needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitialSyncResponse {
    #[serde(default)]
    pub messages: MessagesResponse,
    #[serde(default)]
    pub state: Vec<Event>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PublicRoom {
    pub room_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub canonical_alias: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub num_joined_members: i64,
    #[serde(default)]
    pub world_readable: bool,
    #[serde(default)]
    pub guest_can_join: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublicRoomsResponse {
    #[serde(default)]
    pub chunk: Vec<PublicRoom>,
    #[serde(default)]
    pub next_batch: Option<String>,
    #[serde(default)]
    pub total_room_count_estimate: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomAliasResponse {
    pub room_id: String,
    #[serde(default)]
    pub servers: Vec<String>,
}

/// Standard error body returned by the homeserver.
#[derive(Debug, Clone, Deserialize)]
pub struct MatrixErrorBody {
    pub errcode: String,
    #[serde(default)]
    pub error: String,
}

// ==============================================================================
// 4. HTTP query parameters
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DirectoryQuery {
    pub page: Option<usize>,
    pub q: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub anchor: Option<String>,
    pub offset: Option<i64>,
    pub highlight: Option<String>,
}

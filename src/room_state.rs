// src/room_state.rs
//! Folds state events into the current state of one room and derives the
//! sorted member, server and alias lists shown by the front-end.

use crate::types::{Event, EventContent, MemberContent, PowerLevels};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

pub const EMPTY_ROOM_NAME: &str = "Empty Room";
const MEMBERSHIP_JOIN: &str = "join";
const MEMBERSHIP_LEAVE: &str = "leave";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberInfo {
    pub user_id: String,
    pub membership: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub power_level: i64,
}

impl MemberInfo {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_owned(),
            membership: MEMBERSHIP_LEAVE.to_owned(),
            display_name: None,
            avatar_url: None,
            power_level: 0,
        }
    }

    /// Display name, or the user id when none is set.
    pub fn name(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.user_id,
        }
    }

    fn merge(&mut self, content: &MemberContent) {
        if let Some(membership) = &content.membership {
            self.membership = membership.clone();
        }
        if let Some(avatar_url) = &content.avatar_url {
            self.avatar_url = Some(avatar_url.clone());
        }
        if let Some(display_name) = &content.displayname {
            self.display_name = Some(display_name.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerUserCount {
    pub server_name: String,
    pub num_users: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomServerAliases {
    pub server_name: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RoomState {
    pub creator: Option<String>,
    pub room_version: Option<String>,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub canonical_alias: Option<String>,
    pub avatar_url: Option<String>,
    pub power_levels: PowerLevels,
    pub member_map: HashMap<String, MemberInfo>,
    alias_map: HashMap<String, Vec<String>>,

    // Derived by `recalculate`.
    member_list: Vec<MemberInfo>,
    server_list: Vec<ServerUserCount>,
    alias_list: Vec<RoomServerAliases>,
}

fn compare_members(a: &MemberInfo, b: &MemberInfo) -> Ordering {
    b.power_level
        .cmp(&a.power_level)
        .then_with(|| a.name().cmp(b.name()))
        .then_with(|| a.user_id.cmp(&b.user_id))
}

fn sorted_aliases(alias_map: &HashMap<String, Vec<String>>) -> Vec<RoomServerAliases> {
    let mut list: Vec<RoomServerAliases> = alias_map
        .iter()
        .map(|(server, aliases)| {
            let mut aliases = aliases.clone();
            aliases.sort();
            RoomServerAliases {
                server_name: server.clone(),
                aliases,
            }
        })
        .collect();
    list.sort_by(|a, b| {
        b.aliases
            .len()
            .cmp(&a.aliases.len())
            .then_with(|| a.server_name.cmp(&b.server_name))
    });
    list
}

impl RoomState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a batch of events. Events without a state key are ignored.
    /// With `use_previous_content`, member events first apply their
    /// `prev_content` before the current content.
    pub fn apply<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>, use_previous_content: bool) {
        for event in events {
            self.apply_event(event, use_previous_content);
        }
    }

    pub fn apply_event(&mut self, event: &Event, use_previous_content: bool) {
        let Some(state_key) = event.state_key.as_deref() else {
            return;
        };

        match &event.content {
            EventContent::Create(c) => {
                if let Some(creator) = &c.creator {
                    self.creator = Some(creator.clone());
                }
                if let Some(version) = &c.room_version {
                    self.room_version = Some(version.clone());
                }
            }
            EventContent::Name(c) => {
                if let Some(name) = &c.name {
                    self.name = Some(name.clone());
                }
            }
            EventContent::Topic(c) => {
                if let Some(topic) = &c.topic {
                    self.topic = Some(topic.clone());
                }
            }
            EventContent::Avatar(c) => {
                if let Some(url) = &c.url {
                    self.avatar_url = Some(url.clone());
                }
            }
            EventContent::CanonicalAlias(c) => {
                if let Some(alias) = &c.alias {
                    self.canonical_alias = Some(alias.clone());
                }
            }
            EventContent::Aliases(c) => {
                if !c.aliases.is_empty() {
                    self.alias_map.insert(state_key.to_owned(), c.aliases.clone());
                }
            }
            EventContent::Member(content) => {
                let member = self
                    .member_map
                    .entry(state_key.to_owned())
                    .or_insert_with(|| MemberInfo::new(state_key));
                if use_previous_content {
                    if let Some(prev) = event.prev_member_content() {
                        member.merge(&prev);
                    }
                }
                member.merge(content);
            }
            EventContent::PowerLevels(levels) => {
                self.power_levels = levels.clone();
            }
            EventContent::Redaction(_) | EventContent::Other { .. } => {}
        }
    }

    /// Rebuilds the member, server and alias lists. Must run after any
    /// change to members, power levels or aliases before those lists are read.
    pub fn recalculate(&mut self) {
        for member in self.member_map.values_mut() {
            member.power_level = self.power_levels.user_level(&member.user_id);
        }

        let mut members: Vec<MemberInfo> = self
            .member_map
            .values()
            .filter(|m| m.membership == MEMBERSHIP_JOIN)
            .cloned()
            .collect();
        members.sort_by(compare_members);

        let mut per_server: BTreeMap<&str, usize> = BTreeMap::new();
        for member in &members {
            if let Some((_, server)) = member.user_id.split_once(':') {
                *per_server.entry(server).or_default() += 1;
            }
        }
        let mut servers: Vec<ServerUserCount> = per_server
            .into_iter()
            .map(|(server_name, num_users)| ServerUserCount {
                server_name: server_name.to_owned(),
                num_users,
            })
            .collect();
        servers.sort_by(|a, b| {
            b.num_users
                .cmp(&a.num_users)
                .then_with(|| a.server_name.cmp(&b.server_name))
        });

        self.member_list = members;
        self.server_list = servers;
        self.alias_list = sorted_aliases(&self.alias_map);
    }

    /// Joined members, highest power level first.
    pub fn members(&self) -> &[MemberInfo] {
        &self.member_list
    }

    pub fn servers(&self) -> &[ServerUserCount] {
        &self.server_list
    }

    pub fn aliases(&self) -> &[RoomServerAliases] {
        &self.alias_list
    }

    pub fn num_members(&self) -> usize {
        self.member_list.len()
    }

    /// Number of distinct users with a membership event in state.
    pub fn num_member_events(&self) -> usize {
        self.member_map.len()
    }

    pub fn member(&self, user_id: &str) -> Option<&MemberInfo> {
        self.member_map.get(user_id)
    }

    /// Room display name: name, canonical alias, first published alias, fallback.
    pub fn calculate_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_owned();
        }
        if let Some(alias) = self.canonical_alias.as_deref().filter(|a| !a.is_empty()) {
            return alias.to_owned();
        }
        sorted_aliases(&self.alias_map)
            .into_iter()
            .find_map(|entry| entry.aliases.into_iter().next())
            .unwrap_or_else(|| EMPTY_ROOM_NAME.to_owned())
    }
}

// src/worker.rs
//! Sharded room cache. Every room is owned by exactly one worker task, chosen
//! by hashing its id, and all access to a room goes through that worker's
//! queue. Jobs for one room therefore run one at a time, in order.

use crate::{
    error::RoomError,
    pagination::page_bounds,
    room::{Room, RoomContext, RoomInfo},
    room_state::{MemberInfo, RoomServerAliases, ServerUserCount},
    types::{power_level_role, Event, PowerLevels},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub const DEFAULT_NUM_WORKERS: usize = 32;
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

// ==============================================================================
// 1. Job protocol
// ==============================================================================

pub type Reply<T> = oneshot::Sender<Result<T, RoomError>>;

pub enum Job {
    InitialSync {
        room_id: String,
        reply: Reply<()>,
    },
    GetEventsPage {
        room_id: String,
        anchor: String,
        offset: i64,
        page_size: usize,
        reply: Reply<RoomEventsResp>,
    },
    GetMembers {
        room_id: String,
        page: usize,
        page_size: usize,
        reply: Reply<RoomMembersResp>,
    },
    GetServers {
        room_id: String,
        page: usize,
        page_size: usize,
        reply: Reply<RoomServersResp>,
    },
    GetAliases {
        room_id: String,
        page: usize,
        page_size: usize,
        reply: Reply<RoomAliasesResp>,
    },
    GetMemberInfo {
        room_id: String,
        user_id: String,
        reply: Reply<RoomMemberInfoResp>,
    },
    GetPowerLevels {
        room_id: String,
        reply: Reply<RoomPowerLevelsResp>,
    },
    /// Broadcast to every worker; each sends one report on `done`.
    ForwardPaginateAndEvict {
        ttl: ChronoDuration,
        keep_min: usize,
        done: mpsc::Sender<SweepReport>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomEventsResp {
    pub room_info: RoomInfo,
    pub events: Vec<Event>,
    /// Members who sent the events on this page.
    pub member_map: HashMap<String, MemberInfo>,
    pub at_top_end: bool,
    pub at_bottom_end: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomMembersResp {
    pub room_info: RoomInfo,
    pub members: Vec<MemberInfo>,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomServersResp {
    pub room_info: RoomInfo,
    pub servers: Vec<ServerUserCount>,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomAliasesResp {
    pub room_info: RoomInfo,
    pub aliases: Vec<RoomServerAliases>,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomMemberInfoResp {
    pub room_info: RoomInfo,
    pub member: MemberInfo,
    pub role: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomPowerLevelsResp {
    pub room_info: RoomInfo,
    pub power_levels: PowerLevels,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub worker_id: usize,
    pub evicted: usize,
    pub remaining: usize,
    pub forward_failures: usize,
}

// ==============================================================================
// 2. Routing
// ==============================================================================

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

pub fn shard_for(room_id: &str, num_workers: usize) -> usize {
    fnv1a_32(room_id.as_bytes()) as usize % num_workers.max(1)
}

// ==============================================================================
// 3. Worker
// ==============================================================================

pub struct Worker {
    id: usize,
    ctx: Arc<RoomContext>,
    rooms: HashMap<String, Room>,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<RoomContext>) -> Self {
        Self {
            id,
            ctx,
            rooms: HashMap::new(),
        }
    }

    pub fn num_rooms(&self) -> usize {
        self.rooms.len()
    }

    /// Runs jobs until every sender of `queue` is gone.
    pub async fn run(mut self, mut queue: mpsc::Receiver<Job>) {
        debug!("👷 [WORKER {}] Started", self.id);
        while let Some(job) = queue.recv().await {
            self.handle(job).await;
        }
        info!(
            "[WORKER {}] Queue closed, dropping {} cached rooms",
            self.id,
            self.rooms.len()
        );
    }

    async fn handle(&mut self, job: Job) {
        // A reply that cannot be delivered means the requester went away.
        match job {
            Job::InitialSync { room_id, reply } => {
                let _ = reply.send(self.initial_sync(&room_id).await);
            }
            Job::GetEventsPage {
                room_id,
                anchor,
                offset,
                page_size,
                reply,
            } => {
                let _ = reply.send(self.events_page(&room_id, &anchor, offset, page_size).await);
            }
            Job::GetMembers {
                room_id,
                page,
                page_size,
                reply,
            } => {
                let _ = reply.send(self.with_room(&room_id, |room| {
                    let members = room.state().members();
                    RoomMembersResp {
                        room_info: room.room_info(),
                        members: members[page_bounds(page, page_size, members.len())].to_vec(),
                        page,
                        page_size,
                    }
                }));
            }
            Job::GetServers {
                room_id,
                page,
                page_size,
                reply,
            } => {
                let _ = reply.send(self.with_room(&room_id, |room| {
                    let servers = room.state().servers();
                    RoomServersResp {
                        room_info: room.room_info(),
                        servers: servers[page_bounds(page, page_size, servers.len())].to_vec(),
                        page,
                        page_size,
                    }
                }));
            }
            Job::GetAliases {
                room_id,
                page,
                page_size,
                reply,
            } => {
                let _ = reply.send(self.with_room(&room_id, |room| {
                    let aliases = room.state().aliases();
                    RoomAliasesResp {
                        room_info: room.room_info(),
                        aliases: aliases[page_bounds(page, page_size, aliases.len())].to_vec(),
                        page,
                        page_size,
                    }
                }));
            }
            Job::GetMemberInfo {
                room_id,
                user_id,
                reply,
            } => {
                let result = self
                    .with_room(&room_id, |room| {
                        room.state().member(&user_id).cloned().map(|member| RoomMemberInfoResp {
                            room_info: room.room_info(),
                            role: power_level_role(member.power_level),
                            member,
                        })
                    })
                    .and_then(|found| found.ok_or(RoomError::MemberNotFound { room_id, user_id }));
                let _ = reply.send(result);
            }
            Job::GetPowerLevels { room_id, reply } => {
                let _ = reply.send(self.with_room(&room_id, |room| RoomPowerLevelsResp {
                    room_info: room.room_info(),
                    power_levels: room.state().power_levels.clone(),
                }));
            }
            Job::ForwardPaginateAndEvict { ttl, keep_min, done } => {
                let report = self.sweep(ttl, keep_min, Utc::now()).await;
                if done.send(report).await.is_err() {
                    warn!("[WORKER {}] Sweep requester went away", self.id);
                }
            }
        }
    }

    async fn initial_sync(&mut self, room_id: &str) -> Result<(), RoomError> {
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.access();
            return Ok(());
        }
        let room = Room::new(self.ctx.clone(), room_id).await?;
        self.rooms.insert(room_id.to_owned(), room);
        debug!("[WORKER {}] Now caching {} rooms", self.id, self.rooms.len());
        Ok(())
    }

    /// Builds a reply from a cached room and stamps the access.
    fn with_room<T>(&mut self, room_id: &str, build: impl FnOnce(&Room) -> T) -> Result<T, RoomError> {
        let room = self.rooms.get_mut(room_id).ok_or_else(|| RoomError::NotLoaded {
            room_id: room_id.to_owned(),
        })?;
        let out = build(room);
        room.access();
        Ok(out)
    }

    async fn events_page(
        &mut self,
        room_id: &str,
        anchor: &str,
        offset: i64,
        page_size: usize,
    ) -> Result<RoomEventsResp, RoomError> {
        let room = self.rooms.get_mut(room_id).ok_or_else(|| RoomError::NotLoaded {
            room_id: room_id.to_owned(),
        })?;
        let page = room.get_event_page(anchor, offset, page_size).await?;

        let state = room.state();
        let member_map = page
            .events
            .iter()
            .filter_map(|event| state.member(&event.sender))
            .map(|member| (member.user_id.clone(), member.clone()))
            .collect();

        Ok(RoomEventsResp {
            room_info: room.room_info(),
            events: page.events,
            member_map,
            at_top_end: page.at_top_end,
            at_bottom_end: page.at_bottom_end,
        })
    }

    /// Drops rooms idle for longer than `ttl`, never going below the
    /// `keep_min` most recently used ones.
    pub fn evict_stale(&mut self, ttl: ChronoDuration, keep_min: usize, now: DateTime<Utc>) -> usize {
        if self.rooms.len() <= keep_min {
            return 0;
        }

        let mut by_access: Vec<(DateTime<Utc>, String)> = self
            .rooms
            .iter()
            .map(|(id, room)| (room.last_access(), id.clone()))
            .collect();
        by_access.sort_by(|a, b| b.0.cmp(&a.0));

        // A ttl beyond chrono's date range keeps everything.
        let Some(cutoff) = now.checked_sub_signed(ttl) else {
            return 0;
        };
        let mut evicted = 0;
        for (last_access, room_id) in by_access.into_iter().skip(keep_min) {
            if last_access < cutoff {
                self.rooms.remove(&room_id);
                debug!("[WORKER {}] Evicted {}", self.id, room_id);
                evicted += 1;
            }
        }
        evicted
    }

    async fn sweep(&mut self, ttl: ChronoDuration, keep_min: usize, now: DateTime<Utc>) -> SweepReport {
        let evicted = self.evict_stale(ttl, keep_min, now);

        let mut forward_failures = 0;
        for room in self.rooms.values_mut() {
            if let Err(e) = room.forward_paginate().await {
                warn!("[WORKER {}] Forward pagination failed: {}", self.id, e);
                forward_failures += 1;
            }
        }

        SweepReport {
            worker_id: self.id,
            evicted,
            remaining: self.rooms.len(),
            forward_failures,
        }
    }
}

// ==============================================================================
// 4. Pool
// ==============================================================================

/// Handle to the running workers. Cloning is cheap; the workers stop once
/// every clone has been dropped.
#[derive(Clone)]
pub struct WorkerPool {
    senders: Arc<Vec<mpsc::Sender<Job>>>,
}

impl WorkerPool {
    /// Spawns `num_workers` worker tasks. Must be called inside a tokio runtime.
    pub fn new(num_workers: usize, queue_depth: usize, ctx: Arc<RoomContext>) -> Self {
        let num_workers = num_workers.max(1);
        let senders = (0..num_workers)
            .map(|id| {
                let (tx, rx) = mpsc::channel(queue_depth.max(1));
                tokio::spawn(Worker::new(id, ctx.clone()).run(rx));
                tx
            })
            .collect();

        info!(
            "👷 [WORKER POOL] Spawned {} workers (queue depth {})",
            num_workers, queue_depth
        );
        Self {
            senders: Arc::new(senders),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.senders.len()
    }

    pub fn worker_index(&self, room_id: &str) -> usize {
        shard_for(room_id, self.senders.len())
    }

    /// Queues `job` on the worker owning `room_id`, waiting while the queue is full.
    pub async fn dispatch(&self, room_id: &str, job: Job) -> Result<(), RoomError> {
        self.senders[self.worker_index(room_id)]
            .send(job)
            .await
            .map_err(|_| RoomError::WorkerUnavailable)
    }

    async fn request<T>(&self, room_id: &str, job: impl FnOnce(Reply<T>) -> Job) -> Result<T, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(room_id, job(tx)).await?;
        rx.await.map_err(|_| RoomError::WorkerUnavailable)?
    }

    /// Loads the room into its worker's cache unless it is already there.
    pub async fn initial_sync(&self, room_id: &str) -> Result<(), RoomError> {
        self.request(room_id, |reply| Job::InitialSync {
            room_id: room_id.to_owned(),
            reply,
        })
        .await
    }

    pub async fn events_page(
        &self,
        room_id: &str,
        anchor: &str,
        offset: i64,
        page_size: usize,
    ) -> Result<RoomEventsResp, RoomError> {
        self.request(room_id, |reply| Job::GetEventsPage {
            room_id: room_id.to_owned(),
            anchor: anchor.to_owned(),
            offset,
            page_size,
            reply,
        })
        .await
    }

    pub async fn members(&self, room_id: &str, page: usize, page_size: usize) -> Result<RoomMembersResp, RoomError> {
        self.request(room_id, |reply| Job::GetMembers {
            room_id: room_id.to_owned(),
            page,
            page_size,
            reply,
        })
        .await
    }

    pub async fn servers(&self, room_id: &str, page: usize, page_size: usize) -> Result<RoomServersResp, RoomError> {
        self.request(room_id, |reply| Job::GetServers {
            room_id: room_id.to_owned(),
            page,
            page_size,
            reply,
        })
        .await
    }

    pub async fn aliases(&self, room_id: &str, page: usize, page_size: usize) -> Result<RoomAliasesResp, RoomError> {
        self.request(room_id, |reply| Job::GetAliases {
            room_id: room_id.to_owned(),
            page,
            page_size,
            reply,
        })
        .await
    }

    pub async fn member_info(&self, room_id: &str, user_id: &str) -> Result<RoomMemberInfoResp, RoomError> {
        self.request(room_id, |reply| Job::GetMemberInfo {
            room_id: room_id.to_owned(),
            user_id: user_id.to_owned(),
            reply,
        })
        .await
    }

    pub async fn power_levels(&self, room_id: &str) -> Result<RoomPowerLevelsResp, RoomError> {
        self.request(room_id, |reply| Job::GetPowerLevels {
            room_id: room_id.to_owned(),
            reply,
        })
        .await
    }

    /// Broadcasts one sweep to every worker and waits for all of them to report.
    pub async fn forward_paginate_and_evict(&self, ttl: ChronoDuration, keep_min: usize) -> Vec<SweepReport> {
        let (done_tx, mut done_rx) = mpsc::channel(self.senders.len());
        for (worker_id, sender) in self.senders.iter().enumerate() {
            let job = Job::ForwardPaginateAndEvict {
                ttl,
                keep_min,
                done: done_tx.clone(),
            };
            if sender.send(job).await.is_err() {
                warn!("[WORKER POOL] Worker {} is gone, skipping sweep", worker_id);
            }
        }
        // The channel closes once every queued job has reported.
        drop(done_tx);

        let mut reports = Vec::with_capacity(self.senders.len());
        while let Some(report) = done_rx.recv().await {
            reports.push(report);
        }
        reports.sort_by_key(|r| r.worker_id);
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mxclient::fake::{message, state_event, FakeHomeserver};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn context(hs: &Arc<FakeHomeserver>) -> Arc<RoomContext> {
        Arc::new(RoomContext::new(hs.clone(), "https://hs.one"))
    }

    fn room_id(n: usize) -> String {
        format!("!room{}:hs.one", n)
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn routing_is_stable_and_in_range() {
        for n in 0..200 {
            let id = room_id(n);
            let shard = shard_for(&id, DEFAULT_NUM_WORKERS);
            assert!(shard < DEFAULT_NUM_WORKERS);
            assert_eq!(shard, shard_for(&id, DEFAULT_NUM_WORKERS));
        }
        assert_eq!(shard_for("!anything:hs", 0), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_sync_once() {
        let hs = Arc::new(FakeHomeserver::new());
        hs.add_room(&room_id(1), 10, vec![]);
        let pool = WorkerPool::new(4, 16, context(&hs));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.initial_sync(&room_id(1)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(hs.initial_syncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn room_jobs_require_a_loaded_room() {
        let hs = Arc::new(FakeHomeserver::new());
        let pool = WorkerPool::new(2, 4, context(&hs));

        let err = pool.members(&room_id(1), 1, 20).await.unwrap_err();
        assert!(matches!(err, RoomError::NotLoaded { .. }));

        // Refused rooms are not cached, so the next request tries again.
        assert!(matches!(
            pool.initial_sync(&room_id(1)).await,
            Err(RoomError::Unavailable { .. })
        ));
        hs.add_room(&room_id(1), 3, vec![]);
        pool.initial_sync(&room_id(1)).await.unwrap();
        assert_eq!(hs.initial_syncs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn list_jobs_page_and_stamp_room_info() {
        let hs = Arc::new(FakeHomeserver::new());
        let mut state = vec![state_event("m.room.name", "", json!({ "name": "Lobby" }))];
        for n in 0..45 {
            state.push(state_event(
                "m.room.member",
                &format!("@user{:02}:hs.one", n),
                json!({ "membership": "join" }),
            ));
        }
        state.push(state_event(
            "m.room.power_levels",
            "",
            json!({ "users": { "@user07:hs.one": 100 }, "users_default": 0 }),
        ));
        hs.add_room(&room_id(1), 5, state);
        let pool = WorkerPool::new(2, 4, context(&hs));
        pool.initial_sync(&room_id(1)).await.unwrap();

        let resp = pool.members(&room_id(1), 3, 20).await.unwrap();
        assert_eq!(resp.room_info.name, "Lobby");
        assert_eq!(resp.room_info.num_members, 45);
        assert_eq!(resp.members.len(), 5);

        let first = pool.members(&room_id(1), 1, 20).await.unwrap();
        assert_eq!(first.members[0].user_id, "@user07:hs.one");

        let everyone = pool.members(&room_id(1), 0, 20).await.unwrap();
        assert_eq!(everyone.members.len(), 45);

        let servers = pool.servers(&room_id(1), 1, 30).await.unwrap();
        assert_eq!(servers.servers.len(), 1);
        assert_eq!(servers.servers[0].num_users, 45);

        let levels = pool.power_levels(&room_id(1)).await.unwrap();
        assert_eq!(levels.power_levels.user_level("@user07:hs.one"), 100);

        let member = pool.member_info(&room_id(1), "@user07:hs.one").await.unwrap();
        assert_eq!(member.member.power_level, 100);
        assert_eq!(member.role, "Admin");
        let err = pool.member_info(&room_id(1), "@ghost:hs.one").await.unwrap_err();
        assert!(matches!(err, RoomError::MemberNotFound { .. }));
    }

    #[tokio::test]
    async fn events_page_carries_only_page_senders() {
        let hs = Arc::new(FakeHomeserver::new());
        hs.add_room(
            &room_id(1),
            0,
            vec![
                state_event("m.room.member", "@alice:hs.one", json!({ "membership": "join" })),
                state_event("m.room.member", "@bob:hs.one", json!({ "membership": "join" })),
            ],
        );
        for n in 0..5 {
            hs.push_event(&room_id(1), message(&room_id(1), n));
        }
        let pool = WorkerPool::new(1, 4, context(&hs));
        pool.initial_sync(&room_id(1)).await.unwrap();

        let resp = pool.events_page(&room_id(1), "", 0, 30).await.unwrap();
        assert_eq!(resp.events.len(), 5);
        assert!(resp.at_top_end);
        assert!(resp.at_bottom_end);
        assert_eq!(resp.member_map.len(), 1);
        assert!(resp.member_map.contains_key("@alice:hs.one"));
    }

    #[tokio::test]
    async fn eviction_keeps_the_most_recent_floor() {
        let hs = Arc::new(FakeHomeserver::new());
        let mut worker = Worker::new(0, context(&hs));
        for n in 0..15 {
            hs.add_room(&room_id(n), 1, vec![]);
            worker.initial_sync(&room_id(n)).await.unwrap();
        }

        let now = Utc::now();
        // Rooms 0..12 are stale, with room 12 the most recent of them.
        for n in 0..15 {
            let age = if n < 13 {
                ChronoDuration::hours(2) - ChronoDuration::minutes(n as i64)
            } else {
                ChronoDuration::minutes(1)
            };
            worker.rooms.get_mut(&room_id(n)).unwrap().set_last_access(now - age);
        }

        let evicted = worker.evict_stale(ChronoDuration::minutes(30), 10, now);
        assert_eq!(evicted, 5);
        assert_eq!(worker.num_rooms(), 10);
        for n in 5..15 {
            assert!(worker.rooms.contains_key(&room_id(n)), "room {} evicted", n);
        }
    }

    #[tokio::test]
    async fn eviction_never_touches_the_newest_rooms_even_when_stale() {
        let hs = Arc::new(FakeHomeserver::new());
        let mut worker = Worker::new(0, context(&hs));
        let now = Utc::now();
        // Ages in minutes; all but room 4 are past a 30 minute ttl.
        let ages = [40, 50, 60, 70, 1];
        for (n, age) in ages.iter().enumerate() {
            hs.add_room(&room_id(n), 1, vec![]);
            worker.initial_sync(&room_id(n)).await.unwrap();
            worker
                .rooms
                .get_mut(&room_id(n))
                .unwrap()
                .set_last_access(now - ChronoDuration::minutes(*age));
        }

        assert_eq!(worker.evict_stale(ChronoDuration::minutes(30), 3, now), 2);
        for n in [0, 1, 4] {
            assert!(worker.rooms.contains_key(&room_id(n)));
        }
    }

    #[tokio::test]
    async fn eviction_is_a_no_op_at_or_below_the_floor() {
        let hs = Arc::new(FakeHomeserver::new());
        let mut worker = Worker::new(0, context(&hs));
        for n in 0..10 {
            hs.add_room(&room_id(n), 1, vec![]);
            worker.initial_sync(&room_id(n)).await.unwrap();
            worker
                .rooms
                .get_mut(&room_id(n))
                .unwrap()
                .set_last_access(Utc::now() - ChronoDuration::days(1));
        }
        assert_eq!(worker.evict_stale(ChronoDuration::minutes(30), 10, Utc::now()), 0);
        assert_eq!(worker.num_rooms(), 10);
    }

    #[tokio::test]
    async fn sweep_reports_from_every_worker_and_pulls_live_events() {
        let hs = Arc::new(FakeHomeserver::new());
        let pool = WorkerPool::new(4, 4, context(&hs));
        for n in 0..8 {
            hs.add_room(&room_id(n), 2, vec![]);
            pool.initial_sync(&room_id(n)).await.unwrap();
        }
        hs.push_event(&room_id(3), message(&room_id(3), 2));

        let reports = pool.forward_paginate_and_evict(ChronoDuration::minutes(30), 10).await;
        assert_eq!(reports.len(), 4);
        assert_eq!(reports.iter().map(|r| r.remaining).sum::<usize>(), 8);
        assert!(reports.iter().all(|r| r.evicted == 0 && r.forward_failures == 0));
        assert_eq!(hs.forward_calls.load(Ordering::SeqCst), 8);

        let resp = pool.events_page(&room_id(3), "", 0, 30).await.unwrap();
        assert_eq!(resp.events.len(), 3);
        assert_eq!(resp.events[0].event_id, message(&room_id(3), 2).event_id);
    }
}

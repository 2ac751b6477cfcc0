// src/timeline.rs
//! Gapless event buffer for one room. Index 0 is the newest known event,
//! higher indexes are older. The buffer only ever grows at its two ends, by
//! contiguous pages fetched with the back and forward pagination tokens.

use crate::{
    error::{ApiError, RoomError},
    mxclient::MatrixApi,
    room_state::RoomState,
    types::{Direction, Event},
};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{info, warn};

/// Smallest number of events requested from the homeserver in one go.
pub const MINIMUM_PAGINATION: usize = 64;
/// Events requested when looking for an anchor that is not buffered yet.
pub const ANCHOR_BACKFILL: usize = 100;
/// Extra events kept buffered past a requested page so that neighbouring
/// pages rarely need another round-trip.
pub const SAFETY_MARGIN: usize = 32;

#[derive(Debug, Clone, Default, Serialize)]
pub struct EventPage {
    pub events: Vec<Event>,
    pub at_top_end: bool,
    pub at_bottom_end: bool,
}

#[derive(Debug, Default)]
pub struct Timeline {
    events: VecDeque<Event>,
    back_token: String,
    forward_token: String,
    historic_end_reached: bool,
}

impl Timeline {
    /// Seeds the buffer from a chronological chunk (oldest first), as returned
    /// by an initial sync. Redactions are dropped.
    pub fn new(chronological: Vec<Event>, back_token: String, forward_token: String) -> Self {
        let events = chronological
            .into_iter()
            .rev()
            .filter(|event| !event.is_redaction())
            .collect();
        Self {
            events,
            back_token,
            forward_token,
            historic_end_reached: false,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Event> {
        self.events.get(index)
    }

    pub fn historic_end_reached(&self) -> bool {
        self.historic_end_reached
    }

    pub fn position(&self, event_id: &str) -> Option<usize> {
        self.events.iter().position(|event| event.event_id == event_id)
    }

    /// Fetches at least `amount` older events and appends them to the tail.
    /// Returns how many events the homeserver sent back; zero means the start
    /// of the room is buffered. On error nothing changes.
    pub async fn backpaginate(&mut self, api: &dyn MatrixApi, room_id: &str, amount: usize) -> Result<usize, ApiError> {
        let amount = amount.max(MINIMUM_PAGINATION);
        info!("📜 [BACKFILL {}] Requesting {} events", room_id, amount);

        let resp = api
            .room_messages(room_id, &self.back_token, Direction::Backward, amount)
            .await
            .inspect_err(|e| warn!("❌ [BACKFILL {}] Failed: {}", room_id, e))?;

        let received = resp.chunk.len();
        self.events
            .extend(resp.chunk.into_iter().filter(|event| !event.is_redaction()));
        if let Some(end) = resp.end {
            self.back_token = end;
        }
        if received == 0 {
            info!("🏁 [BACKFILL {}] Reached the start of the room", room_id);
            self.historic_end_reached = true;
        }
        Ok(received)
    }

    /// Fetches events newer than the head, folding each into `state` before it
    /// is prepended so that live state tracks the timeline.
    pub async fn forward_paginate(
        &mut self,
        api: &dyn MatrixApi,
        room_id: &str,
        state: &mut RoomState,
    ) -> Result<usize, ApiError> {
        let resp = api
            .room_messages(room_id, &self.forward_token, Direction::Forward, MINIMUM_PAGINATION)
            .await?;

        let received = resp.chunk.len();
        for event in resp.chunk {
            if event.is_redaction() {
                continue;
            }
            state.apply_event(&event, false);
            self.events.push_front(event);
        }
        if let Some(end) = resp.end {
            self.forward_token = end;
        }
        if received > 0 {
            state.recalculate();
        }
        Ok(received)
    }

    /// `Ok(None)` only once a backfill has actually run (or history is
    /// exhausted) and the anchor is still missing.
    async fn find_anchor(&mut self, api: &dyn MatrixApi, room_id: &str, anchor: &str) -> Result<Option<usize>, ApiError> {
        if let Some(index) = self.position(anchor) {
            return Ok(Some(index));
        }
        if self.historic_end_reached {
            return Ok(None);
        }
        // One backfill, one more scan.
        let received = self.backpaginate(api, room_id, ANCHOR_BACKFILL).await?;
        Ok(if received > 0 { self.position(anchor) } else { None })
    }

    /// Reads `page_size` events around `anchor` (the newest event when empty).
    /// A non-negative `offset` walks toward history and may backfill once; a
    /// negative `offset` walks toward the present from the buffer alone.
    pub async fn get_page(
        &mut self,
        api: &dyn MatrixApi,
        room_id: &str,
        anchor: &str,
        offset: i64,
        page_size: usize,
    ) -> Result<EventPage, RoomError> {
        let anchor_index = if anchor.is_empty() {
            0
        } else {
            self.find_anchor(api, room_id, anchor)
                .await
                .map_err(|e| RoomError::from_api(room_id, e))?
                .ok_or_else(|| RoomError::AnchorNotFound {
                    room_id: room_id.to_owned(),
                    anchor: anchor.to_owned(),
                })?
        };

        let (start, end) = if offset >= 0 {
            let start = anchor_index.saturating_add(offset as usize);
            let wanted = start.saturating_add(page_size).saturating_add(SAFETY_MARGIN);
            if !self.historic_end_reached && wanted >= self.events.len() {
                // A failure here is served from what is buffered.
                let _ = self.backpaginate(api, room_id, wanted - self.events.len()).await;
            }
            let len = self.events.len();
            let start = start.min(len);
            (start, start.saturating_add(page_size).min(len))
        } else {
            let back = usize::try_from(offset.unsigned_abs()).unwrap_or(usize::MAX);
            let top = anchor_index
                .saturating_add(page_size)
                .saturating_sub(back)
                .min(self.events.len());
            (top.saturating_sub(page_size), top)
        };

        Ok(EventPage {
            events: self.events.range(start..end).cloned().collect(),
            at_top_end: end == self.events.len(),
            at_bottom_end: start == 0,
        })
    }
}

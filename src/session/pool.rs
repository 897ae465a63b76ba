//! Fixed-capacity session table.
//!
//! Slots are allocated by scanning for a `Free` one. Handles carry the slot
//! generation, so a handle kept after its session ended never reaches the
//! session that reuses the slot.

use std::fmt;
use std::time::Instant;

use serde::Serialize;

use super::state::{Session, SessionState};
use crate::config::ServerConfig;

/// Handle to a session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId {
    index: usize,
    generation: u32,
}

impl SessionId {
    /// Create a handle from its parts.
    pub fn new(index: usize, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Slot generation.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws{}.{}", self.index, self.generation)
    }
}

/// Bounded array of sessions.
#[derive(Debug)]
pub struct SessionPool<C> {
    slots: Vec<Session<C>>,
    next_seq: u64,
}

impl<C> SessionPool<C> {
    /// Create `config.max_sessions` free slots.
    pub fn new(config: &ServerConfig, now: Instant) -> Self {
        let slots = (0..config.max_sessions)
            .map(|index| Session::free(SessionId::new(index, 0), config, now))
            .collect();
        Self { slots, next_seq: 0 }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn active(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }

    /// Put `conn` into the first free slot.
    ///
    /// Hands `conn` back if every slot is occupied.
    pub fn allocate(&mut self, conn: C, config: &ServerConfig, now: Instant) -> Result<SessionId, C> {
        let Some(index) = self.slots.iter().position(Session::is_free) else {
            return Err(conn);
        };
        let slot = &mut self.slots[index];
        let id = SessionId::new(index, slot.id().generation().wrapping_add(1));

        self.next_seq += 1;
        *slot = Session::connecting(id, conn, config, now, self.next_seq);
        Ok(id)
    }

    /// Return a slot to `Free`, handing back the connection it held.
    pub fn release(&mut self, id: SessionId, config: &ServerConfig, now: Instant) -> Option<C> {
        let slot = self.get_mut(id)?;
        let conn = slot.take_conn();
        *slot = Session::free(id, config, now);
        conn
    }

    /// Look up a live session.
    pub fn get(&self, id: SessionId) -> Option<&Session<C>> {
        self.slots
            .get(id.index)
            .filter(|s| s.id() == id && !s.is_free())
    }

    /// Look up a live session mutably.
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session<C>> {
        self.slots
            .get_mut(id.index)
            .filter(|s| s.id() == id && !s.is_free())
    }

    /// Handles of all live sessions, in slot order.
    pub fn ids(&self) -> Vec<SessionId> {
        self.slots
            .iter()
            .filter(|s| !s.is_free())
            .map(Session::id)
            .collect()
    }

    /// Live sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session<C>> {
        self.slots.iter().filter(|s| !s.is_free())
    }

    /// Live sessions, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session<C>> {
        self.slots.iter_mut().filter(|s| !s.is_free())
    }

    /// Live sessions in a given state.
    pub fn in_state(&self, state: SessionState) -> Vec<SessionId> {
        self.iter()
            .filter(|s| s.state() == state)
            .map(Session::id)
            .collect()
    }

    /// The longest-lived session flagged stale by a link loss.
    pub fn oldest_stale(&self) -> Option<SessionId> {
        self.iter()
            .filter(|s| s.is_stale())
            .min_by_key(|s| s.accepted_seq())
            .map(Session::id)
    }
}

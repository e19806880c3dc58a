// Copyright (c) 2019-2020, Arm Limited, All Rights Reserved
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may
// not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//          http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Process-wide session registry: ownership tracking, state transitions,
//! and the bounded abandoned-session FIFO.

use std::collections::{HashMap, VecDeque};

use log::warn;

use crate::connection::ConnectionId;

/// Upper bound on the number of `SAVED_CLIENT_CLOSED` sessions the
/// resource manager will hold before evicting the oldest.
pub const MAX_ABANDONED: usize = 4;

/// Lifecycle state of a tracked [`SessionEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Resident in the TPM.
    Loaded,
    /// RM-owned saved context; the RM may reload it at will.
    SavedRm,
    /// The client exported the context via `ContextSave` and owns
    /// presenting it back to `ContextLoad`.
    SavedClient,
    /// The owning client disconnected while `SavedClient`; lives in the
    /// abandoned FIFO, claimable by any connection.
    SavedClientClosed,
}

/// One tracked TPM session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub handle: u32,
    pub owner: ConnectionId,
    pub state: SessionState,
    pub saved_context: Vec<u8>,
}

/// Process-wide session registry.
///
/// A session handle appears in at most one of the active map or the
/// abandoned FIFO at any time.
#[derive(Debug, Default)]
pub struct SessionList {
    active: HashMap<u32, SessionEntry>,
    abandoned: VecDeque<SessionEntry>,
}

impl SessionList {
    pub fn new() -> SessionList {
        SessionList { active: HashMap::new(), abandoned: VecDeque::new() }
    }

    pub fn insert(&mut self, entry: SessionEntry) {
        self.active.insert(entry.handle, entry);
    }

    pub fn lookup(&self, handle: u32) -> Option<&SessionEntry> {
        self.active.get(&handle)
    }

    pub fn lookup_mut(&mut self, handle: u32) -> Option<&mut SessionEntry> {
        self.active.get_mut(&handle)
    }

    /// Remove a session handle from both the active map and the abandoned
    /// FIFO, wherever it currently lives.
    pub fn remove(&mut self, handle: u32) -> Option<SessionEntry> {
        if let Some(entry) = self.active.remove(&handle) {
            return Some(entry);
        }
        if let Some(pos) = self.abandoned.iter().position(|e| e.handle == handle) {
            return self.abandoned.remove(pos);
        }
        None
    }

    /// Find an active session by exact-byte-equality of its saved opaque
    /// context, as `ContextLoad` requires. Abandoned
    /// sessions are not eligible for this lookup path in this crate's
    /// flow: by the time a context reaches the abandoned FIFO its owner
    /// has already disconnected, and the only way back into ownership is
    /// via a claim, handled by [`SessionList::claim_abandoned`].
    pub fn lookup_by_context(&self, context: &[u8]) -> Option<&SessionEntry> {
        self.active.values().find(|e| e.saved_context == context)
    }

    pub fn lookup_abandoned_by_context(&self, context: &[u8]) -> Option<&SessionEntry> {
        self.abandoned.iter().find(|e| e.saved_context == context)
    }

    /// Count of sessions currently owned by `owner`, across both
    /// collections (a session is only ever in one, but the cap is a
    /// per-connection cap on sessions the connection can be charged for,
    /// and abandoned sessions are no longer charged to anyone).
    pub fn count_owned_by(&self, owner: ConnectionId) -> usize {
        self.active.values().filter(|e| e.owner == owner).count()
    }

    pub fn is_full(&self, owner: ConnectionId, cap: usize) -> bool {
        self.count_owned_by(owner) >= cap
    }

    /// Move a `SavedClient` session into the abandoned FIFO as
    /// `SavedClientClosed`, evicting the oldest entry first if the FIFO is
    /// already at [`MAX_ABANDONED`].
    ///
    /// Returns the evicted entry, if any bumping was required; the caller
    /// is responsible for flushing it from the TPM. Returns `None` without
    /// modifying the FIFO if `handle` is not currently active.
    pub fn abandon(&mut self, handle: u32) -> Option<SessionEntry> {
        let mut entry = self.active.remove(&handle)?;
        entry.state = SessionState::SavedClientClosed;
        let evicted = if self.abandoned.len() >= MAX_ABANDONED {
            self.abandoned.pop_front()
        } else {
            None
        };
        self.abandoned.push_back(entry);
        evicted
    }

    /// Atomically remove an abandoned session by handle and reassign its
    /// owner, returning the reassigned entry. Fails if the entry is no
    /// longer in the FIFO (e.g. concurrently claimed or evicted).
    pub fn claim_abandoned(&mut self, handle: u32, new_owner: ConnectionId) -> Option<SessionEntry> {
        let pos = self.abandoned.iter().position(|e| e.handle == handle)?;
        let mut entry = self.abandoned.remove(pos)?;
        entry.owner = new_owner;
        entry.state = SessionState::SavedRm;
        self.active.insert(entry.handle, entry.clone());
        Some(entry)
    }

    /// All sessions currently owned by `owner`, across the active map
    /// only (used by the connection-close reaper, which only ever sees
    /// live ownership — abandoned sessions by definition have no live
    /// owner).
    pub fn owned_by(&self, owner: ConnectionId) -> Vec<SessionEntry> {
        self.active.values().filter(|e| e.owner == owner).cloned().collect()
    }

    /// Handles currently `Loaded`, for the between-command save pass.
    /// Order is unspecified.
    pub fn loaded_handles(&self) -> Vec<u32> {
        self.active
            .values()
            .filter(|e| e.state == SessionState::Loaded)
            .map(|e| e.handle)
            .collect()
    }

    pub fn abandoned_len(&self) -> usize {
        self.abandoned.len()
    }

    pub fn abandoned_handles(&self) -> Vec<u32> {
        self.abandoned.iter().map(|e| e.handle).collect()
    }

    /// Every handle tracked, for invariant checks in tests: each must
    /// appear in exactly one of the two collections.
    #[cfg(test)]
    pub fn all_handles(&self) -> Vec<u32> {
        let mut v: Vec<u32> = self.active.keys().copied().collect();
        v.extend(self.abandoned.iter().map(|e| e.handle));
        v
    }
}

pub fn warn_connection_mismatch(context: &str) {
    warn!("{}: connection from command and session entry do not match, refusing", context);
}

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

//! The per-command pipeline: quota enforcement, handle/session
//! virtualisation, and the connection-close reaper. [`Dispatcher`] owns the
//! process-wide [`SessionList`] and every connection's transient
//! [`HandleMap`][crate::handle::HandleMap], and is the only thing that
//! talks to the [`AccessBroker`].

use std::collections::HashMap;

use log::warn;

use crate::access_broker::AccessBroker;
use crate::config::QuotaConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::ResmgrError;
use crate::handle::{PhysicalHandle, VirtualHandle};
use crate::session::{warn_connection_mismatch, SessionEntry, SessionList, SessionState};
use crate::wire::{self, cc, Header, HandleType};

/// Drives the per-command pipeline against one connection table, one
/// process-wide session registry, and one physical TPM.
pub struct Dispatcher<B: AccessBroker> {
    connections: HashMap<ConnectionId, Connection>,
    sessions: SessionList,
    broker: B,
    quota: QuotaConfig,
}

impl<B: AccessBroker> Dispatcher<B> {
    pub fn new(broker: B, quota: QuotaConfig) -> Dispatcher<B> {
        Dispatcher { connections: HashMap::new(), sessions: SessionList::new(), broker, quota }
    }

    pub fn add_connection(&mut self, id: ConnectionId) {
        self.connections
            .entry(id)
            .or_insert_with(|| Connection::new(id, self.quota.transient_cap, self.quota.session_cap));
    }

    pub fn has_connection(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Run one command through the full pipeline and return
    /// the response bytes to send back to the caller. `command` must be a
    /// well-formed header at minimum; on connection lookup failure or
    /// header parse failure this synthesises a parameter error rather than
    /// panicking, since the engine cannot guarantee a malicious or buggy
    /// client sends well-formed bytes.
    pub fn process_command(&mut self, conn_id: ConnectionId, mut command: Vec<u8>) -> Vec<u8> {
        let header = match Header::parse(&command) {
            Ok(h) => h,
            Err(e) => return wire::build_rc_response(e.response_code().unwrap_or(0xffff_ffff)),
        };

        let mut loaded_transients: Vec<VirtualHandle> = Vec::new();
        let mut response;

        if let Some(e) = self.quota_check(conn_id, header.code) {
            response = wire::build_rc_response(e.response_code().unwrap_or(0xffff_ffff));
        } else if let Some(special) = self.special_processing(conn_id, &mut command, &header) {
            response = special;
        } else {
            self.load_handles(conn_id, &mut command, &header, &mut loaded_transients);
            self.load_auths(conn_id, &command, &header);

            response = match self.broker.send(&command) {
                Ok(r) => r,
                Err(e) => wire::build_rc_response(e.response_code().unwrap_or(0xffff_ffff)),
            };
            self.post_process_response(conn_id, &header, &mut response, &mut loaded_transients);
        }

        self.save_sessions();
        self.reconcile_transients(conn_id, &header, &loaded_transients);

        response
    }

    /// Evict every resource owned by a closing connection:
    /// flush its resident transient objects (none should be resident at a
    /// command boundary, but a connection can close mid-command in some
    /// transports, so this is defensive), abandon or flush its sessions
    /// depending on state, and drop its entry from the connection table.
    pub fn close_connection(&mut self, conn_id: ConnectionId) {
        if let Some(conn) = self.connections.get(&conn_id) {
            let resident: Vec<u32> = conn
                .transients
                .vhandles_sorted()
                .into_iter()
                .filter_map(|v| conn.transients.lookup(VirtualHandle(v)).and_then(|e| e.phandle))
                .map(|p| p.0)
                .collect();
            for phandle in resident {
                if let Err(e) = self.broker.context_flush(phandle) {
                    warn!("failed to flush resident transient 0x{:08x} on connection close: {:?}", phandle, e);
                }
            }
        }

        for entry in self.sessions.owned_by(conn_id) {
            match entry.state {
                SessionState::SavedClient => {
                    if let Some(evicted) = self.sessions.abandon(entry.handle) {
                        if let Err(e) = self.broker.context_flush(evicted.handle) {
                            warn!(
                                "failed to flush abandoned session 0x{:08x} evicted to make room: {:?}",
                                evicted.handle, e
                            );
                        }
                    }
                }
                SessionState::SavedRm => {
                    if let Err(e) = self.broker.context_flush(entry.handle) {
                        warn!("failed to flush RM-saved session 0x{:08x} on connection close: {:?}", entry.handle, e);
                    }
                    self.sessions.remove(entry.handle);
                }
                SessionState::Loaded | SessionState::SavedClientClosed => {
                    panic!(
                        "{}",
                        ResmgrError::InvariantViolation(format!(
                            "connection {:?} owned session 0x{:08x} in state {:?} at close",
                            conn_id, entry.handle, entry.state
                        ))
                    );
                }
            }
        }

        self.connections.remove(&conn_id);
    }

    /// Step 1: per-connection quota enforcement for the two kinds of
    /// command that create new long-lived resources.
    fn quota_check(&self, conn_id: ConnectionId, code: u32) -> Option<ResmgrError> {
        match code {
            cc::CREATE_PRIMARY | cc::LOAD | cc::LOAD_EXTERNAL => {
                let conn = self.connections.get(&conn_id)?;
                conn.transients.is_full().then_some(ResmgrError::ObjectMemory)
            }
            cc::START_AUTH_SESSION => {
                self.sessions
                    .is_full(conn_id, self.connections.get(&conn_id)?.session_cap)
                    .then_some(ResmgrError::SessionMemory)
            }
            _ => None,
        }
    }

    /// Step 2: commands the resource manager answers itself
    /// rather than forwarding verbatim. Returns `Some(response)` when the
    /// pipeline should skip straight to post-processing; `None` to fall
    /// through to the normal handle/auth-area load and forward.
    fn special_processing(
        &mut self,
        conn_id: ConnectionId,
        command: &mut [u8],
        header: &Header,
    ) -> Option<Vec<u8>> {
        match header.code {
            cc::FLUSH_CONTEXT => self.flush_context(conn_id, command),
            cc::CONTEXT_SAVE => self.context_save_special(conn_id, command),
            cc::CONTEXT_LOAD => self.context_load_special(conn_id, command),
            cc::GET_CAPABILITY => self.get_capability_special(conn_id, command),
            _ => None,
        }
    }

    fn flush_context(&mut self, conn_id: ConnectionId, command: &[u8]) -> Option<Vec<u8>> {
        let target = wire::command_handle(command, 0)?;
        match HandleType::of(target) {
            HandleType::Transient => {
                let conn = self.connections.get_mut(&conn_id)?;
                match conn.transients.remove(VirtualHandle(target)) {
                    Some(_) => Some(wire::build_rc_response(wire::TPM2_RC_SUCCESS)),
                    None => Some(wire::build_rc_response(
                        ResmgrError::UnknownTransientHandle.response_code().unwrap(),
                    )),
                }
            }
            HandleType::HmacSession | HandleType::PolicySession => {
                let was_loaded =
                    self.sessions.lookup(target).map(|e| e.state == SessionState::Loaded).unwrap_or(false);
                self.sessions.remove(target);
                if was_loaded {
                    // The TPM still has it resident; forward the original,
                    // untouched command so the TPM actually flushes it.
                    None
                } else {
                    Some(wire::build_rc_response(wire::TPM2_RC_SUCCESS))
                }
            }
            HandleType::Other(_) => None,
        }
    }

    fn context_save_special(&mut self, conn_id: ConnectionId, command: &[u8]) -> Option<Vec<u8>> {
        let target = wire::command_handle(command, 0)?;
        if !HandleType::of(target).is_session() {
            return None;
        }
        let entry = self.sessions.lookup_mut(target)?;
        if entry.owner != conn_id {
            warn_connection_mismatch("ContextSave");
            return None;
        }
        if entry.state != SessionState::SavedRm {
            warn!("ContextSave on session 0x{:08x} not in SAVED_RM (state {:?})", target, entry.state);
            return None;
        }
        entry.state = SessionState::SavedClient;
        Some(wire::build_context_save_response(entry.handle, &entry.saved_context))
    }

    fn context_load_special(&mut self, conn_id: ConnectionId, command: &[u8]) -> Option<Vec<u8>> {
        let body = command.get(wire::HEADER_SIZE..)?;
        let ctx = match wire::TpmsContext::parse(body) {
            Ok(ctx) => ctx,
            Err(e) => return Some(wire::build_rc_response(e.response_code().unwrap_or(0xffff_ffff))),
        };
        if !HandleType::of(ctx.saved_handle).is_session() {
            // Transient contexts are not virtualised; forward untouched.
            return None;
        }
        if let Some(entry) = self.sessions.lookup_by_context(&ctx.blob) {
            let handle = entry.handle;
            if entry.owner != conn_id {
                warn_connection_mismatch("ContextLoad");
                return Some(wire::build_rc_response(
                    ResmgrError::AccessDenied.response_code().unwrap(),
                ));
            }
            if let Some(e) = self.sessions.lookup_mut(handle) {
                e.state = SessionState::SavedRm;
            }
            return Some(wire::build_context_load_response(handle));
        }
        if let Some(entry) = self.sessions.lookup_abandoned_by_context(&ctx.blob) {
            let handle = entry.handle;
            let claimed = self.sessions.claim_abandoned(handle, conn_id)?;
            return Some(wire::build_context_load_response(claimed.handle));
        }
        // Unknown session context: the RM has nothing to hand back; let the
        // TPM itself reject it.
        None
    }

    fn get_capability_special(&mut self, conn_id: ConnectionId, command: &[u8]) -> Option<Vec<u8>> {
        let params = wire::parse_get_capability_params(command)?;
        if params.capability != wire::TPM2_CAP_HANDLES
            || !matches!(HandleType::of(params.property), HandleType::Transient)
        {
            return None;
        }
        let conn = self.connections.get(&conn_id)?;
        let mut handles = conn.transients.vhandles_sorted();
        handles.retain(|h| *h >= params.property);
        let total = handles.len();
        handles.truncate(params.property_count as usize);
        let more_data = handles.len() < total;
        Some(wire::build_get_capability_handles_response(&handles, more_data))
    }

    /// Step 3: rewrite every transient vhandle in the command's handle area
    /// to the physical handle the TPM knows it by, loading its saved
    /// context first. Session handles in the handle area are never
    /// renumbered, but still need to be resident before the command
    /// reaches the TPM (e.g. `PolicyPCR`/`PolicySecret` name their policy
    /// session in the handle area, not the auth area), so they go through
    /// the same load-from-`SAVED_RM` path auth-area sessions use (§4.4).
    fn load_handles(
        &mut self,
        conn_id: ConnectionId,
        command: &mut [u8],
        header: &Header,
        loaded: &mut Vec<VirtualHandle>,
    ) {
        let handle_count = wire::command_info(header.code).handle_count;
        for i in 0..handle_count {
            let Some(h) = wire::command_handle(command, i) else { continue };
            match HandleType::of(h) {
                HandleType::Transient => {
                    let Some(conn) = self.connections.get_mut(&conn_id) else { continue };
                    let Some(entry) = conn.transients.lookup_mut(VirtualHandle(h)) else { continue };
                    match self.broker.context_load(&entry.saved_context) {
                        Ok(phandle) => {
                            entry.phandle = Some(PhysicalHandle(phandle));
                            wire::set_command_handle(command, i, phandle);
                            loaded.push(VirtualHandle(h));
                        }
                        Err(e) => warn!("context_load failed for vhandle 0x{:08x}: {:?}", h, e),
                    }
                }
                t if t.is_session() => self.load_session(conn_id, h, false),
                _ => {}
            }
        }
    }

    /// Step 4: resolve every session handle named in
    /// the auth area, loading it from `SAVED_RM` if necessary.
    fn load_auths(&mut self, conn_id: ConnectionId, command: &[u8], header: &Header) {
        let info = wire::command_info(header.code);
        if !info.has_auths {
            return;
        }
        let auths = wire::parse_auths(command, info.handle_count);
        for auth in auths {
            if !HandleType::of(auth.handle).is_session() {
                continue;
            }
            let will_flush = auth.attrs & wire::TPMA_SESSION_CONTINUE_SESSION == 0;
            self.load_session(conn_id, auth.handle, will_flush);
        }
    }

    /// Resolve one session handle for use in the current command
    /// only `SAVED_RM` sessions owned by `conn_id` are
    /// loaded; anything else is left alone and the TPM will reject the
    /// command on its own terms.
    fn load_session(&mut self, conn_id: ConnectionId, handle: u32, will_flush: bool) {
        {
            let entry = match self.sessions.lookup(handle) {
                Some(e) => e,
                None => return,
            };
            if entry.owner != conn_id {
                warn_connection_mismatch("auth-area session load");
                return;
            }
            if entry.state != SessionState::SavedRm {
                return;
            }
        }
        let saved_context = self.sessions.lookup(handle).unwrap().saved_context.clone();
        match self.broker.context_load(&saved_context) {
            Ok(_phandle) => {
                if let Some(e) = self.sessions.lookup_mut(handle) {
                    e.state = SessionState::Loaded;
                }
                if will_flush {
                    self.sessions.remove(handle);
                }
            }
            Err(e) => {
                warn!("context_load failed for session 0x{:08x}: {:?}", handle, e);
                self.sessions.remove(handle);
            }
        }
    }

    /// Step 6: virtualise any handle a successful response
    /// hands back — a freshly created transient gets a vhandle, a freshly
    /// created session is recorded as owned by `conn_id`.
    fn post_process_response(
        &mut self,
        conn_id: ConnectionId,
        header: &Header,
        response: &mut [u8],
        loaded: &mut Vec<VirtualHandle>,
    ) {
        if !wire::command_info(header.code).returns_handle {
            return;
        }
        let Some(handle) = wire::response_handle(response) else { return };
        match HandleType::of(handle) {
            HandleType::Transient => {
                let Some(conn) = self.connections.get_mut(&conn_id) else { return };
                let vhandle = conn.transients.insert_new();
                if let Some(entry) = conn.transients.lookup_mut(vhandle) {
                    entry.phandle = Some(PhysicalHandle(handle));
                }
                loaded.push(vhandle);
                wire::set_response_handle(response, vhandle.0);
            }
            HandleType::HmacSession | HandleType::PolicySession => {
                if self.sessions.lookup(handle).is_none() {
                    self.sessions.insert(SessionEntry {
                        handle,
                        owner: conn_id,
                        state: SessionState::Loaded,
                        saved_context: Vec::new(),
                    });
                }
            }
            HandleType::Other(_) => {}
        }
    }

    /// Step 8: every session left `Loaded` after a command
    /// must be pushed back out to `SAVED_RM` before the next command can
    /// run, so that the TPM's limited session slots are available to other
    /// connections.
    fn save_sessions(&mut self) {
        for handle in self.sessions.loaded_handles() {
            match self.broker.context_save(handle) {
                Ok(blob) => {
                    if let Some(e) = self.sessions.lookup_mut(handle) {
                        e.saved_context = blob;
                        e.state = SessionState::SavedRm;
                    }
                }
                Err(e) => {
                    warn!("context_save failed for session 0x{:08x}, flushing: {:?}", handle, e);
                    let _ = self.broker.context_flush(handle);
                    self.sessions.remove(handle);
                }
            }
        }
    }

    /// Step 9: reconcile every transient loaded for this
    /// command back out of the TPM, unless the command itself already
    /// flushed everything (`TPMA_CC_FLUSHED`).
    fn reconcile_transients(&mut self, conn_id: ConnectionId, header: &Header, loaded: &[VirtualHandle]) {
        if loaded.is_empty() {
            return;
        }
        if wire::command_info(header.code).flushed {
            if let Some(conn) = self.connections.get_mut(&conn_id) {
                for v in loaded {
                    conn.transients.remove(*v);
                }
            }
            return;
        }
        for v in loaded {
            let Some(conn) = self.connections.get_mut(&conn_id) else { continue };
            let Some(entry) = conn.transients.lookup_mut(*v) else { continue };
            let Some(phandle) = entry.phandle else { continue };
            match self.broker.context_saveflush(phandle.0) {
                Ok(blob) => {
                    entry.saved_context = blob;
                    entry.phandle = None;
                }
                Err(e) => warn!("context_saveflush failed for vhandle 0x{:08x}: {:?}", v.0, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_broker::MockAccessBroker;
    use crate::error::{RC_HANDLE_P_1, RESMGR_RC_OBJECT_MEMORY, RESMGR_RC_SESSION_MEMORY};

    fn header(code: u32, size: u32) -> Vec<u8> {
        let mut out = Vec::new();
        Header { tag: 0x8001, size, code }.write(&mut out);
        out
    }

    fn new_dispatcher() -> Dispatcher<MockAccessBroker> {
        Dispatcher::new(MockAccessBroker::new(), QuotaConfig { transient_cap: 2, session_cap: 2 })
    }

    #[test]
    fn load_then_use_then_implicit_flush_virtualises_handle() {
        let mut disp = new_dispatcher();
        let conn = ConnectionId(1);
        disp.add_connection(conn);

        // Load: command carries 0 handles of its own but a vhandle cannot
        // be manufactured from nothing; simulate it arriving via
        // post-processing by sending a LOAD-shaped command.
        let mut load_cmd = header(cc::LOAD, 10);
        load_cmd.extend_from_slice(&[0u8; 8]); // placeholder auth+params
        let resp_handle = 0x8000_0001u32;
        let mut load_resp = wire::build_rc_response(wire::TPM2_RC_SUCCESS);
        load_resp.extend_from_slice(&resp_handle.to_be_bytes());
        disp.broker.push_response(Ok(load_resp));

        let resp = disp.process_command(conn, load_cmd);
        let vhandle = wire::response_handle(&resp).unwrap();
        assert_eq!(vhandle >> 24, 0x80);

        let conn_ref = disp.connections.get(&conn).unwrap();
        assert_eq!(conn_ref.transients.len(), 1);
        assert!(conn_ref.transients.lookup(VirtualHandle(vhandle)).unwrap().phandle.is_none());
    }

    #[test]
    fn flush_context_on_unknown_transient_synthesises_error() {
        let mut disp = new_dispatcher();
        let conn = ConnectionId(1);
        disp.add_connection(conn);

        let mut cmd = header(cc::FLUSH_CONTEXT, 14);
        cmd.extend_from_slice(&0x8000_00ffu32.to_be_bytes());
        let resp = disp.process_command(conn, cmd);
        let h = Header::parse(&resp).unwrap();
        assert_eq!(h.code, RC_HANDLE_P_1);
        assert!(disp.broker.calls.is_empty());
    }

    #[test]
    fn flush_context_on_known_transient_removes_without_forwarding() {
        let mut disp = new_dispatcher();
        let conn = ConnectionId(1);
        disp.add_connection(conn);
        let vhandle = disp.connections.get_mut(&conn).unwrap().transients.insert_new();

        let mut cmd = header(cc::FLUSH_CONTEXT, 14);
        cmd.extend_from_slice(&vhandle.0.to_be_bytes());
        let resp = disp.process_command(conn, cmd);
        assert_eq!(Header::parse(&resp).unwrap().code, wire::TPM2_RC_SUCCESS);
        assert!(disp.connections.get(&conn).unwrap().transients.lookup(vhandle).is_none());
        assert!(disp.broker.calls.is_empty());
    }

    #[test]
    fn flush_context_on_saved_session_answers_locally() {
        let mut disp = new_dispatcher();
        let conn = ConnectionId(1);
        disp.add_connection(conn);
        disp.sessions.insert(SessionEntry {
            handle: 0x0200_0001,
            owner: conn,
            state: SessionState::SavedRm,
            saved_context: b"ctx".to_vec(),
        });

        let mut cmd = header(cc::FLUSH_CONTEXT, 14);
        cmd.extend_from_slice(&0x0200_0001u32.to_be_bytes());
        let resp = disp.process_command(conn, cmd);
        assert_eq!(Header::parse(&resp).unwrap().code, wire::TPM2_RC_SUCCESS);
        assert!(disp.sessions.lookup(0x0200_0001).is_none());
        assert!(disp.broker.calls.is_empty());
    }

    #[test]
    fn flush_context_on_loaded_session_forwards_to_tpm() {
        let mut disp = new_dispatcher();
        let conn = ConnectionId(1);
        disp.add_connection(conn);
        disp.sessions.insert(SessionEntry {
            handle: 0x0200_0002,
            owner: conn,
            state: SessionState::Loaded,
            saved_context: Vec::new(),
        });
        disp.broker.push_response(Ok(wire::build_rc_response(wire::TPM2_RC_SUCCESS)));

        let mut cmd = header(cc::FLUSH_CONTEXT, 14);
        cmd.extend_from_slice(&0x0200_0002u32.to_be_bytes());
        let _ = disp.process_command(conn, cmd);
        assert_eq!(disp.broker.calls.len(), 1);
        assert!(disp.sessions.lookup(0x0200_0002).is_none());
    }

    #[test]
    fn transient_quota_rejects_without_touching_broker() {
        let mut disp = new_dispatcher();
        let conn = ConnectionId(1);
        disp.add_connection(conn);
        disp.connections.get_mut(&conn).unwrap().transients.insert_new();
        disp.connections.get_mut(&conn).unwrap().transients.insert_new();

        let cmd = header(cc::LOAD, 10);
        let resp = disp.process_command(conn, cmd);
        assert_eq!(Header::parse(&resp).unwrap().code, RESMGR_RC_OBJECT_MEMORY);
        assert!(disp.broker.calls.is_empty());
    }

    #[test]
    fn session_save_and_claim_roundtrip() {
        let mut disp = new_dispatcher();
        let c1 = ConnectionId(1);
        let c2 = ConnectionId(2);
        disp.add_connection(c1);
        disp.add_connection(c2);
        disp.sessions.insert(SessionEntry {
            handle: 0x0200_0003,
            owner: c1,
            state: SessionState::SavedRm,
            saved_context: b"session-ctx".to_vec(),
        });

        let mut save_cmd = header(cc::CONTEXT_SAVE, 14);
        save_cmd.extend_from_slice(&0x0200_0003u32.to_be_bytes());
        let save_resp = disp.process_command(c1, save_cmd);
        let ctx = wire::TpmsContext::parse(&save_resp[wire::HEADER_SIZE..]).unwrap();
        assert_eq!(ctx.blob, b"session-ctx");
        assert_eq!(disp.sessions.lookup(0x0200_0003).unwrap().state, SessionState::SavedClient);

        // c2 cannot load it: connection-close reaper moves it to abandoned
        // before a claim can succeed, so simulate the close directly.
        disp.close_connection(c1);
        assert_eq!(disp.sessions.abandoned_len(), 1);

        let mut load_cmd = header(cc::CONTEXT_LOAD, 10 + 8 + 4 + 4 + 2 + ctx.blob.len() as u32);
        load_cmd.extend_from_slice(&ctx.sequence.to_be_bytes());
        load_cmd.extend_from_slice(&ctx.saved_handle.to_be_bytes());
        load_cmd.extend_from_slice(&ctx.hierarchy.to_be_bytes());
        load_cmd.extend_from_slice(&(ctx.blob.len() as u16).to_be_bytes());
        load_cmd.extend_from_slice(&ctx.blob);
        let load_resp = disp.process_command(c2, load_cmd);
        assert_eq!(Header::parse(&load_resp).unwrap().code, wire::TPM2_RC_SUCCESS);
        assert_eq!(wire::response_handle(&load_resp), Some(0x0200_0003));
        assert_eq!(disp.sessions.lookup(0x0200_0003).unwrap().owner, c2);
    }

    #[test]
    fn flushed_command_drops_transients_without_saveflush() {
        let mut disp = new_dispatcher();
        let conn = ConnectionId(1);
        disp.add_connection(conn);
        let vhandle = disp.connections.get_mut(&conn).unwrap().transients.insert_new();

        // CLEAR's handle area names a hierarchy, not the transient itself
        // in the real TPM2 spec, but this crate only ever learns about a
        // resident transient via a handle area it rewrites, so drive it
        // through the same vhandle the connection already owns to observe
        // the flushed-command reconciliation path.
        let mut clear_cmd = header(cc::CLEAR, 18);
        clear_cmd.extend_from_slice(&vhandle.0.to_be_bytes());
        clear_cmd.extend_from_slice(&0u32.to_be_bytes());
        disp.broker.push_response(Ok(wire::build_rc_response(wire::TPM2_RC_SUCCESS)));

        let calls_before = disp.broker.calls.len();
        let _ = disp.process_command(conn, clear_cmd);

        // One context_load (handle-area load) plus the forwarded Clear
        // itself; crucially, no context_saveflush call.
        assert_eq!(disp.broker.calls.len() - calls_before, 2);
        assert!(disp.connections.get(&conn).unwrap().transients.lookup(vhandle).is_none());
        assert!(!disp
            .broker
            .calls
            .iter()
            .any(|c| matches!(c, crate::access_broker::RecordedCall::ContextSaveflush(_))));
    }

    #[test]
    fn abandoned_fifo_evicts_oldest_beyond_capacity() {
        let mut disp = new_dispatcher();
        for i in 0..5u32 {
            let conn = ConnectionId(i as u64);
            disp.add_connection(conn);
            disp.sessions.insert(SessionEntry {
                handle: 0x0300_0000 + i,
                owner: conn,
                state: SessionState::SavedClient,
                saved_context: vec![i as u8],
            });
            disp.close_connection(conn);
        }

        assert_eq!(disp.sessions.abandoned_len(), 4);
        assert_eq!(
            disp.sessions.abandoned_handles(),
            vec![0x0300_0001, 0x0300_0002, 0x0300_0003, 0x0300_0004]
        );
        assert!(disp
            .broker
            .calls
            .contains(&crate::access_broker::RecordedCall::ContextFlush(0x0300_0000)));
    }

    #[test]
    fn session_quota_enforced_independently_of_transient_quota() {
        let mut disp = new_dispatcher();
        let conn = ConnectionId(1);
        disp.add_connection(conn);
        disp.sessions.insert(SessionEntry {
            handle: 0x0200_0042,
            owner: conn,
            state: SessionState::SavedRm,
            saved_context: Vec::new(),
        });
        // new_dispatcher() caps sessions at 2; fill the second slot so the
        // connection is at its quota.
        disp.sessions.insert(SessionEntry {
            handle: 0x0200_0043,
            owner: conn,
            state: SessionState::SavedRm,
            saved_context: Vec::new(),
        });

        let resp = disp.process_command(conn, header(cc::START_AUTH_SESSION, 10));
        assert_eq!(Header::parse(&resp).unwrap().code, RESMGR_RC_SESSION_MEMORY);
        assert!(disp.broker.calls.is_empty());
    }

    #[test]
    fn cross_connection_load_with_forged_context_falls_through_to_tpm() {
        let mut disp = new_dispatcher();
        let owner = ConnectionId(1);
        let stranger = ConnectionId(2);
        disp.add_connection(owner);
        disp.add_connection(stranger);
        disp.sessions.insert(SessionEntry {
            handle: 0x0200_0009,
            owner,
            state: SessionState::SavedRm,
            saved_context: b"real-context".to_vec(),
        });

        let forged_blob = b"guessed-context".to_vec();
        let mut load_cmd = header(cc::CONTEXT_LOAD, (10 + 8 + 4 + 4 + 2 + forged_blob.len()) as u32);
        load_cmd.extend_from_slice(&0u64.to_be_bytes());
        load_cmd.extend_from_slice(&0x0200_0009u32.to_be_bytes());
        load_cmd.extend_from_slice(&wire::TPM2_RH_NULL.to_be_bytes());
        load_cmd.extend_from_slice(&(forged_blob.len() as u16).to_be_bytes());
        load_cmd.extend_from_slice(&forged_blob);

        disp.broker.push_response(Ok(wire::build_rc_response(RC_HANDLE_P_1)));
        let resp = disp.process_command(stranger, load_cmd);

        assert_eq!(Header::parse(&resp).unwrap().code, RC_HANDLE_P_1);
        assert_eq!(disp.sessions.lookup(0x0200_0009).unwrap().owner, owner);
    }

    #[test]
    fn policy_command_loads_owned_session_from_its_handle_area() {
        let mut disp = new_dispatcher();
        let conn = ConnectionId(1);
        disp.add_connection(conn);
        disp.sessions.insert(SessionEntry {
            handle: 0x0300_0001,
            owner: conn,
            state: SessionState::SavedRm,
            saved_context: b"policy-ctx".to_vec(),
        });
        disp.broker.push_response(Ok(wire::build_rc_response(wire::TPM2_RC_SUCCESS)));

        let mut cmd = header(cc::POLICY_PCR, 14);
        cmd.extend_from_slice(&0x0300_0001u32.to_be_bytes());
        let resp = disp.process_command(conn, cmd);

        assert_eq!(Header::parse(&resp).unwrap().code, wire::TPM2_RC_SUCCESS);
        assert!(disp
            .broker
            .calls
            .contains(&crate::access_broker::RecordedCall::ContextLoad(b"policy-ctx".to_vec())));
        // Left Loaded after the command, the session gets pushed back to
        // SAVED_RM by the between-command save pass rather than flushed,
        // since a handle-area session reference never implies
        // !CONTINUE_SESSION the way an auth-area entry's attrs byte would.
        assert_eq!(disp.sessions.lookup(0x0300_0001).unwrap().state, SessionState::SavedRm);
    }

    #[test]
    fn policy_command_ignores_session_owned_by_another_connection() {
        let mut disp = new_dispatcher();
        let owner = ConnectionId(1);
        let stranger = ConnectionId(2);
        disp.add_connection(owner);
        disp.add_connection(stranger);
        disp.sessions.insert(SessionEntry {
            handle: 0x0300_0002,
            owner,
            state: SessionState::SavedRm,
            saved_context: b"owner-ctx".to_vec(),
        });
        disp.broker.push_response(Ok(wire::build_rc_response(wire::TPM2_RC_SUCCESS)));

        let mut cmd = header(cc::POLICY_PCR, 14);
        cmd.extend_from_slice(&0x0300_0002u32.to_be_bytes());
        let _ = disp.process_command(stranger, cmd);

        assert!(!disp
            .broker
            .calls
            .iter()
            .any(|c| matches!(c, crate::access_broker::RecordedCall::ContextLoad(_))));
        assert_eq!(disp.sessions.lookup(0x0300_0002).unwrap().state, SessionState::SavedRm);
    }
}

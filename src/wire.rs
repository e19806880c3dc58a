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

//! TPM2 wire format: the 10-byte command/response header, handle encoding,
//! the `GetCapability(HANDLES)` response body, and just enough of
//! `TPMS_CONTEXT` to recover a session's saved handle.

use crate::error::{ResmgrError, Result};

pub const HEADER_SIZE: usize = 10;

/// Response code for an auth/access failure in parameter 1 (used when a
/// cross-connection session claim is refused).
pub const RC_1_AUTH_FAIL: u32 = 0x0000_098e;

/// TPM2 command codes this crate needs to recognise directly.
pub mod cc {
    pub const CREATE_PRIMARY: u32 = 0x0000_0131;
    pub const LOAD: u32 = 0x0000_0157;
    pub const LOAD_EXTERNAL: u32 = 0x0000_0167;
    pub const START_AUTH_SESSION: u32 = 0x0000_0176;
    pub const FLUSH_CONTEXT: u32 = 0x0000_0165;
    pub const CONTEXT_SAVE: u32 = 0x0000_0161;
    pub const CONTEXT_LOAD: u32 = 0x0000_0162;
    pub const GET_CAPABILITY: u32 = 0x0000_017a;
    pub const READ_PUBLIC: u32 = 0x0000_0173;
    /// `TPM2_CC_PolicySecret`: names an auth object/session handle and a
    /// policy session handle, both in the handle area.
    pub const POLICY_SECRET: u32 = 0x0000_0151;
    /// `TPM2_CC_PolicyPCR`: names only the policy session handle, in the
    /// handle area.
    pub const POLICY_PCR: u32 = 0x0000_017f;
    /// `TPM2_CC_Clear`: one of the few commands the TPM spec marks
    /// `TPMA_CC_FLUSHED` — a successful `Clear` evicts every transient
    /// object and session resident in the TPM.
    pub const CLEAR: u32 = 0x0000_0126;
}

/// `TPM2_CAP_HANDLES`.
pub const TPM2_CAP_HANDLES: u32 = 0x0000_0001;

/// Session attribute bit controlling whether a session is flushed after use.
pub const TPMA_SESSION_CONTINUE_SESSION: u8 = 0x01;

/// `TPM2_RH_NULL`, used as the `hierarchy` field of a session's crafted
/// `TPMS_CONTEXT` — sessions have no hierarchy of their own.
pub const TPM2_RH_NULL: u32 = 0x4000_0007;

/// The handle-type byte occupying bits 24..31 of a TPM handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    Transient,
    HmacSession,
    PolicySession,
    Other(u8),
}

impl HandleType {
    pub fn of(handle: u32) -> HandleType {
        match (handle >> 24) as u8 {
            0x80 => HandleType::Transient,
            0x02 => HandleType::HmacSession,
            0x03 => HandleType::PolicySession,
            other => HandleType::Other(other),
        }
    }

    pub fn is_session(self) -> bool {
        matches!(self, HandleType::HmacSession | HandleType::PolicySession)
    }
}

/// Static per-command metadata the dispatcher needs. The real TPM2 spec
/// defines a `TPMA_CC` table for every command; this crate only needs the
/// handle count and whether the response can carry `TPMA_CC_FLUSHED` for
/// the commands it interacts with directly.
#[derive(Debug, Clone, Copy)]
pub struct CommandInfo {
    pub handle_count: usize,
    pub has_auths: bool,
    /// Whether a success response carries a freshly created handle in its
    /// response handle area.
    pub returns_handle: bool,
    /// Whether the TPM spec marks this command `TPMA_CC_FLUSHED`: a
    /// successful response means the TPM itself evicted every resident
    /// transient object and session.
    pub flushed: bool,
}

pub fn command_info(code: u32) -> CommandInfo {
    match code {
        cc::CREATE_PRIMARY => {
            CommandInfo { handle_count: 1, has_auths: true, returns_handle: true, flushed: false }
        }
        cc::LOAD => {
            CommandInfo { handle_count: 1, has_auths: true, returns_handle: true, flushed: false }
        }
        cc::LOAD_EXTERNAL => {
            CommandInfo { handle_count: 0, has_auths: false, returns_handle: true, flushed: false }
        }
        cc::START_AUTH_SESSION => {
            CommandInfo { handle_count: 2, has_auths: false, returns_handle: true, flushed: false }
        }
        cc::FLUSH_CONTEXT => {
            CommandInfo { handle_count: 0, has_auths: false, returns_handle: false, flushed: false }
        }
        cc::CONTEXT_SAVE => {
            CommandInfo { handle_count: 1, has_auths: false, returns_handle: false, flushed: false }
        }
        cc::CONTEXT_LOAD => {
            CommandInfo { handle_count: 0, has_auths: false, returns_handle: false, flushed: false }
        }
        cc::GET_CAPABILITY => {
            CommandInfo { handle_count: 0, has_auths: false, returns_handle: false, flushed: false }
        }
        cc::READ_PUBLIC => {
            CommandInfo { handle_count: 1, has_auths: false, returns_handle: false, flushed: false }
        }
        cc::POLICY_SECRET => {
            CommandInfo { handle_count: 2, has_auths: false, returns_handle: false, flushed: false }
        }
        cc::POLICY_PCR => {
            CommandInfo { handle_count: 1, has_auths: false, returns_handle: false, flushed: false }
        }
        cc::CLEAR => {
            CommandInfo { handle_count: 1, has_auths: true, returns_handle: false, flushed: true }
        }
        _ => CommandInfo { handle_count: 0, has_auths: false, returns_handle: false, flushed: false },
    }
}

/// Number of bytes occupied by the handle area of a command with
/// `handle_count` handles, starting immediately after the header.
pub fn handle_area_len(handle_count: usize) -> usize {
    handle_count * 4
}

/// One authorization-area entry: the session handle used to authorize the
/// command, and its session attributes byte (only
/// [`TPMA_SESSION_CONTINUE_SESSION`] matters to this crate).
#[derive(Debug, Clone, Copy)]
pub struct AuthEntry {
    pub handle: u32,
    pub attrs: u8,
}

/// Parse the authorization area of a command with `handle_count` handles.
///
/// This crate's wire format encodes the auth area as a 4-byte big-endian
/// byte count followed by that many bytes of 5-byte `(handle, attrs)`
/// entries, omitting the nonce/HMAC fields a real TPM auth session carries
/// — those are meaningful only to the TPM itself, never to the resource
/// manager's virtualisation logic. Returns an empty vector if the command
/// has no auth area or the buffer is too short to hold one.
pub fn parse_auths(buf: &[u8], handle_count: usize) -> Vec<AuthEntry> {
    let offset = HEADER_SIZE + handle_area_len(handle_count);
    if buf.len() < offset + 4 {
        return Vec::new();
    }
    let auth_size =
        u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
            as usize;
    let mut entries = Vec::new();
    let mut pos = offset + 4;
    let end = (pos + auth_size).min(buf.len());
    while pos + 5 <= end {
        let handle = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
        entries.push(AuthEntry { handle, attrs: buf[pos + 4] });
        pos += 5;
    }
    entries
}

/// The 10-byte TPM2 command/response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u16,
    pub size: u32,
    pub code: u32,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Result<Header> {
        if buf.len() < HEADER_SIZE {
            return Err(ResmgrError::BadContextParam);
        }
        Ok(Header {
            tag: u16::from_be_bytes([buf[0], buf[1]]),
            size: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            code: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tag.to_be_bytes());
        out.extend_from_slice(&self.size.to_be_bytes());
        out.extend_from_slice(&self.code.to_be_bytes());
    }
}

pub const TPM2_RC_SUCCESS: u32 = 0;
pub const TPM2_ST_NO_SESSIONS: u16 = 0x8001;

/// Build a minimal success/error response carrying only a header and,
/// optionally, a single handle placed immediately after it.
pub fn build_rc_response(code: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE);
    Header { tag: TPM2_ST_NO_SESSIONS, size: HEADER_SIZE as u32, code }.write(&mut out);
    out
}

/// Build the response to a virtualised session `ContextSave`: a header
/// followed by a `TPMS_CONTEXT` wrapping `blob` opaquely, with `savedHandle`
/// set to the session's own handle so that a later `ContextLoad` can route
/// on it without the resource manager needing a second lookup table.
pub fn build_context_save_response(handle: u32, blob: &[u8]) -> Vec<u8> {
    let body_len = 8 + 4 + 4 + 2 + blob.len();
    let mut out = Vec::with_capacity(HEADER_SIZE + body_len);
    Header {
        tag: TPM2_ST_NO_SESSIONS,
        size: (HEADER_SIZE + body_len) as u32,
        code: TPM2_RC_SUCCESS,
    }
    .write(&mut out);
    out.extend_from_slice(&0u64.to_be_bytes());
    out.extend_from_slice(&handle.to_be_bytes());
    out.extend_from_slice(&TPM2_RH_NULL.to_be_bytes());
    out.extend_from_slice(&(blob.len() as u16).to_be_bytes());
    out.extend_from_slice(blob);
    out
}

/// Build the response to a virtualised `ContextLoad` of a session: a
/// header followed by the session's handle in the response handle area.
pub fn build_context_load_response(handle: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + 4);
    Header {
        tag: TPM2_ST_NO_SESSIONS,
        size: (HEADER_SIZE + 4) as u32,
        code: TPM2_RC_SUCCESS,
    }
    .write(&mut out);
    out.extend_from_slice(&handle.to_be_bytes());
    out
}

/// Read the handle carried in a response's handle area, i.e. the four
/// bytes immediately following the header. Returns `None` for responses
/// with no handle area (the caller must know from context whether one is
/// expected; this crate only calls this for commands with a handle in
/// their response).
pub fn response_handle(buf: &[u8]) -> Option<u32> {
    if buf.len() < HEADER_SIZE + 4 {
        return None;
    }
    Some(u32::from_be_bytes([
        buf[HEADER_SIZE],
        buf[HEADER_SIZE + 1],
        buf[HEADER_SIZE + 2],
        buf[HEADER_SIZE + 3],
    ]))
}

pub fn set_response_handle(buf: &mut [u8], handle: u32) {
    let bytes = handle.to_be_bytes();
    buf[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&bytes);
}

/// A handle at a fixed position in a command's handle area.
pub fn command_handle(buf: &[u8], index: usize) -> Option<u32> {
    let offset = HEADER_SIZE + index * 4;
    if buf.len() < offset + 4 {
        return None;
    }
    Some(u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

pub fn set_command_handle(buf: &mut [u8], index: usize, handle: u32) {
    let offset = HEADER_SIZE + index * 4;
    buf[offset..offset + 4].copy_from_slice(&handle.to_be_bytes());
}

/// Just enough of `TPMS_CONTEXT` to recover the saved handle: a 2-byte
/// length-prefixed blob, preceded by an 8-byte sequence number and a
/// 4-byte hierarchy, all after the 4-byte `savedHandle` field itself.
///
/// Layout (all big-endian): `sequence(8) | savedHandle(4) | hierarchy(4) |
/// contextBlob(2-byte length prefix + bytes)`.
#[derive(Debug, Clone)]
pub struct TpmsContext {
    pub sequence: u64,
    pub saved_handle: u32,
    pub hierarchy: u32,
    pub blob: Vec<u8>,
}

impl TpmsContext {
    pub fn parse(buf: &[u8]) -> Result<TpmsContext> {
        if buf.len() < 8 + 4 + 4 + 2 {
            return Err(ResmgrError::BadContextParam);
        }
        let sequence = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let saved_handle = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let hierarchy = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        let blob_len = u16::from_be_bytes([buf[16], buf[17]]) as usize;
        let blob_start = 18;
        if buf.len() < blob_start + blob_len {
            return Err(ResmgrError::BadContextParam);
        }
        let blob = buf[blob_start..blob_start + blob_len].to_vec();
        Ok(TpmsContext { sequence, saved_handle, hierarchy, blob })
    }
}

/// The three fixed parameters of a `GetCapability` command, which has no
/// handle area and no auth area: `capability(4) | property(4) | propertyCount(4)`,
/// immediately after the header.
#[derive(Debug, Clone, Copy)]
pub struct GetCapabilityParams {
    pub capability: u32,
    pub property: u32,
    pub property_count: u32,
}

pub fn parse_get_capability_params(buf: &[u8]) -> Option<GetCapabilityParams> {
    if buf.len() < HEADER_SIZE + 12 {
        return None;
    }
    let at = |off: usize| {
        u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
    };
    Some(GetCapabilityParams {
        capability: at(HEADER_SIZE),
        property: at(HEADER_SIZE + 4),
        property_count: at(HEADER_SIZE + 8),
    })
}

/// Build the `GetCapability(HANDLES)` response body:
/// `moreData(1) | capability(4 BE) | count(4 BE) | count × handle(4 BE)`.
pub fn build_get_capability_handles_response(handles: &[u32], more_data: bool) -> Vec<u8> {
    let body_len = 1 + 4 + 4 + handles.len() * 4;
    let mut out = Vec::with_capacity(HEADER_SIZE + body_len);
    Header {
        tag: TPM2_ST_NO_SESSIONS,
        size: (HEADER_SIZE + body_len) as u32,
        code: TPM2_RC_SUCCESS,
    }
    .write(&mut out);
    out.push(if more_data { 1 } else { 0 });
    out.extend_from_slice(&TPM2_CAP_HANDLES.to_be_bytes());
    out.extend_from_slice(&(handles.len() as u32).to_be_bytes());
    for h in handles {
        out.extend_from_slice(&h.to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut buf = Vec::new();
        Header { tag: 0x8001, size: 123, code: 0x456 }.write(&mut buf);
        let h = Header::parse(&buf).unwrap();
        assert_eq!(h.tag, 0x8001);
        assert_eq!(h.size, 123);
        assert_eq!(h.code, 0x456);
    }

    #[test]
    fn handle_type_decoding() {
        assert_eq!(HandleType::of(0x8000_0001), HandleType::Transient);
        assert_eq!(HandleType::of(0x0200_0001), HandleType::HmacSession);
        assert_eq!(HandleType::of(0x0300_0001), HandleType::PolicySession);
        assert_eq!(HandleType::of(0x4000_0001), HandleType::Other(0x40));
    }

    #[test]
    fn get_capability_response_layout() {
        let resp = build_get_capability_handles_response(&[0x8000_0001, 0x8000_0002], true);
        assert_eq!(resp.len(), HEADER_SIZE + 1 + 4 + 4 + 8);
        assert_eq!(resp[HEADER_SIZE], 1);
        let cap = u32::from_be_bytes(resp[HEADER_SIZE + 1..HEADER_SIZE + 5].try_into().unwrap());
        assert_eq!(cap, TPM2_CAP_HANDLES);
        let count = u32::from_be_bytes(resp[HEADER_SIZE + 5..HEADER_SIZE + 9].try_into().unwrap());
        assert_eq!(count, 2);
    }

    #[test]
    fn tpms_context_parse_recovers_saved_handle() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u64.to_be_bytes());
        buf.extend_from_slice(&0x0300_0000u32.to_be_bytes());
        buf.extend_from_slice(&0x4000_0001u32.to_be_bytes());
        buf.extend_from_slice(&3u16.to_be_bytes());
        buf.extend_from_slice(&[0xaa, 0xbb, 0xcc]);
        let ctx = TpmsContext::parse(&buf).unwrap();
        assert_eq!(ctx.saved_handle, 0x0300_0000);
        assert_eq!(ctx.blob, vec![0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn tpms_context_parse_rejects_truncated_body() {
        assert!(TpmsContext::parse(&[0u8; 4]).is_err());
    }
}

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

//! Error taxonomy for the resource manager core.
//!
//! Every variant here maps to a TPM response code that the resource manager
//! synthesises for a client, except [`ResmgrError::VhandleRollover`] and
//! [`ResmgrError::InvariantViolation`], which are never returned to a
//! caller: both indicate a broken invariant and are only ever used to
//! `panic!`.

use thiserror::Error;

/// `RESMGR_RC_OBJECT_MEMORY`: the connection's transient object quota is full.
pub const RESMGR_RC_OBJECT_MEMORY: u32 = 0x0000_0902;
/// `RESMGR_RC_SESSION_MEMORY`: the connection's session quota is full.
pub const RESMGR_RC_SESSION_MEMORY: u32 = 0x0000_0903;
/// `RC_HANDLE | RC_P | RC_1`: `FlushContext` referenced an unknown vhandle.
pub const RC_HANDLE_P_1: u32 = 0x0000_018b;
/// Parameter error, parameter 1: malformed `TPMS_CONTEXT` body on `ContextLoad`.
pub const RC_BAD_CONTEXT_PARAM: u32 = 0x0000_01c4;

/// Errors produced by the resource manager's command processing engine.
#[derive(Debug, Error)]
pub enum ResmgrError {
    /// Per-connection transient object quota exceeded.
    #[error("transient object quota exceeded")]
    ObjectMemory,

    /// Per-connection session quota exceeded.
    #[error("session quota exceeded")]
    SessionMemory,

    /// `FlushContext` referenced a transient vhandle this connection does
    /// not own.
    #[error("unknown transient handle")]
    UnknownTransientHandle,

    /// The `AccessBroker` reported a transport failure; `rc` is forwarded
    /// to the client verbatim.
    #[error("TPM access broker transport failure: 0x{0:08x}")]
    Transport(u32),

    /// `ContextLoad`'s body could not be parsed as a `TPMS_CONTEXT`.
    #[error("malformed TPMS_CONTEXT in command body")]
    BadContextParam,

    /// A connection attempted to claim or load a session it does not own.
    #[error("access denied to session")]
    AccessDenied,

    /// Fatal: the per-connection vhandle counter wrapped around to zero.
    ///
    /// Never returned as a response; callers must treat this as a process
    /// abort condition.
    #[error("virtual handle counter rolled over")]
    VhandleRollover,

    /// Fatal: an internal invariant was violated (e.g. a live connection
    /// owned a session left in a resident state at close time).
    ///
    /// Never returned as a response; callers must treat this as a process
    /// abort condition.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl ResmgrError {
    /// The TPM response code this error maps to when synthesising a
    /// response, or `None` for the two fatal variants, which are never
    /// delivered to a client.
    pub fn response_code(&self) -> Option<u32> {
        match self {
            ResmgrError::ObjectMemory => Some(RESMGR_RC_OBJECT_MEMORY),
            ResmgrError::SessionMemory => Some(RESMGR_RC_SESSION_MEMORY),
            ResmgrError::UnknownTransientHandle => Some(RC_HANDLE_P_1),
            ResmgrError::Transport(rc) => Some(*rc),
            ResmgrError::BadContextParam => Some(RC_BAD_CONTEXT_PARAM),
            ResmgrError::AccessDenied => Some(crate::wire::RC_1_AUTH_FAIL),
            ResmgrError::VhandleRollover | ResmgrError::InvariantViolation(_) => None,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ResmgrError>;

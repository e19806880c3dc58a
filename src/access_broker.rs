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

//! The `AccessBroker` contract: a synchronous, serialising
//! wrapper around the physical TPM device. All calls block and are atomic
//! with respect to the device; the resource manager never calls this
//! trait re-entrantly.

use crate::error::{ResmgrError, Result};

/// Serialising access to the physical TPM.
pub trait AccessBroker: Send {
    /// Send a raw command buffer to the TPM and return its raw response.
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>>;

    /// Load a saved context, returning the physical handle now resident.
    fn context_load(&mut self, context: &[u8]) -> Result<u32>;

    /// Save the context resident at `phandle`, leaving it resident.
    fn context_save(&mut self, phandle: u32) -> Result<Vec<u8>>;

    /// Save the context resident at `phandle` and flush it from the TPM
    /// in one step.
    fn context_saveflush(&mut self, phandle: u32) -> Result<Vec<u8>>;

    /// Flush the object resident at `handle` from the TPM without saving.
    fn context_flush(&mut self, handle: u32) -> Result<()>;
}

/// A call recorded by [`MockAccessBroker`], so boundary-behaviour tests
/// can verify behaviour against what actually reached the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Send(Vec<u8>),
    ContextLoad(Vec<u8>),
    ContextSave(u32),
    ContextSaveflush(u32),
    ContextFlush(u32),
}

/// Test double for [`AccessBroker`] that records every call it receives
/// and lets a test script canned responses and failures.
#[derive(Debug, Default)]
pub struct MockAccessBroker {
    pub calls: Vec<RecordedCall>,
    pub send_responses: std::collections::VecDeque<Result<Vec<u8>>>,
    pub next_phandle: u32,
    pub fail_context_load: bool,
    pub fail_context_save: bool,
}

impl MockAccessBroker {
    pub fn new() -> MockAccessBroker {
        MockAccessBroker { next_phandle: 0x8000_0000, ..Default::default() }
    }

    pub fn push_response(&mut self, resp: Result<Vec<u8>>) {
        self.send_responses.push_back(resp);
    }
}

impl AccessBroker for MockAccessBroker {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.calls.push(RecordedCall::Send(command.to_vec()));
        self.send_responses
            .pop_front()
            .unwrap_or_else(|| Err(ResmgrError::Transport(0xdead_beef)))
    }

    fn context_load(&mut self, context: &[u8]) -> Result<u32> {
        self.calls.push(RecordedCall::ContextLoad(context.to_vec()));
        if self.fail_context_load {
            return Err(ResmgrError::Transport(0xbad_0001));
        }
        let phandle = self.next_phandle;
        self.next_phandle += 1;
        Ok(phandle)
    }

    fn context_save(&mut self, phandle: u32) -> Result<Vec<u8>> {
        self.calls.push(RecordedCall::ContextSave(phandle));
        if self.fail_context_save {
            return Err(ResmgrError::Transport(0xbad_0002));
        }
        Ok(format!("ctx-{:08x}", phandle).into_bytes())
    }

    fn context_saveflush(&mut self, phandle: u32) -> Result<Vec<u8>> {
        self.calls.push(RecordedCall::ContextSaveflush(phandle));
        Ok(format!("ctx-{:08x}", phandle).into_bytes())
    }

    fn context_flush(&mut self, handle: u32) -> Result<()> {
        self.calls.push(RecordedCall::ContextFlush(handle));
        Ok(())
    }
}

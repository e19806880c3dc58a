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

//! The single-consumer worker thread that owns the [`Dispatcher`] and, by
//! extension, serialises every command against the physical TPM.
//! A connection manager living above this crate owns
//! accepting transport connections and framing commands; it talks to the
//! engine only through an [`EngineHandle`].

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info};

use crate::access_broker::AccessBroker;
use crate::connection::ConnectionId;
use crate::dispatcher::Dispatcher;

/// Depth of the engine's inbox. Deliberately small: a deep queue just
/// means clients wait longer for a response that is already late, since
/// every command is serialised through one physical TPM.
const INBOX_CAPACITY: usize = 64;

/// One unit of work handed to the engine thread.
enum Message {
    Command { conn_id: ConnectionId, command: Vec<u8>, reply: Sender<Vec<u8>> },
    Connect(ConnectionId),
    Disconnect(ConnectionId),
}

/// A cheaply-clonable reference to a running [`Engine`]'s inbox.
///
/// Dropping every clone of the handle closes the channel, which makes the
/// engine's `for` loop over its inbox return and the worker thread exit.
#[derive(Clone)]
pub struct EngineHandle {
    inbox: Sender<Message>,
}

impl EngineHandle {
    /// Register a new connection with the engine. Must happen before any
    /// command is submitted on `conn_id`.
    pub fn connect(&self, conn_id: ConnectionId) {
        let _ = self.inbox.send(Message::Connect(conn_id));
    }

    /// Tear down everything the engine tracks for `conn_id`.
    pub fn disconnect(&self, conn_id: ConnectionId) {
        let _ = self.inbox.send(Message::Disconnect(conn_id));
    }

    /// Submit a command and block until the engine has processed it and
    /// produced a response. Returns `None` if the engine has shut down
    /// before replying.
    pub fn send_command(&self, conn_id: ConnectionId, command: Vec<u8>) -> Option<Vec<u8>> {
        let (reply_tx, reply_rx) = bounded(1);
        self.inbox.send(Message::Command { conn_id, command, reply: reply_tx }).ok()?;
        reply_rx.recv().ok()
    }
}

/// Owns the [`Dispatcher`] and drains its inbox on a single dedicated
/// thread, so that every `AccessBroker` call — and therefore every
/// physical TPM transaction — happens from exactly one thread
pub struct Engine<B: AccessBroker> {
    dispatcher: Dispatcher<B>,
    inbox: Receiver<Message>,
}

impl<B: AccessBroker + 'static> Engine<B> {
    /// Build an engine around `dispatcher` and spawn its worker thread,
    /// returning a handle callers use to submit work.
    pub fn spawn(dispatcher: Dispatcher<B>, thread_name: &str) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = bounded(INBOX_CAPACITY);
        let engine = Engine { dispatcher, inbox: rx };
        let join = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || engine.run())
            .expect("failed to spawn resource manager worker thread");
        (EngineHandle { inbox: tx }, join)
    }

    /// Drain the inbox until every [`EngineHandle`] clone has been
    /// dropped. Each iteration does at most one unit of work: one command
    /// dispatched end-to-end, or one connection added/torn down. This is
    /// what makes the TPM access single-threaded without any locking —
    /// there is only ever one thread doing the dequeuing.
    fn run(mut self) {
        info!("resource manager engine started");
        for message in self.inbox.iter() {
            match message {
                Message::Command { conn_id, command, reply } => {
                    debug!("dispatching command from {:?} ({} bytes)", conn_id, command.len());
                    let response = self.dispatcher.process_command(conn_id, command);
                    let _ = reply.send(response);
                }
                Message::Connect(conn_id) => {
                    debug!("connection {:?} registered", conn_id);
                    self.dispatcher.add_connection(conn_id);
                }
                Message::Disconnect(conn_id) => {
                    debug!("connection {:?} closing", conn_id);
                    self.dispatcher.close_connection(conn_id);
                }
            }
        }
        info!("resource manager engine inbox closed, shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_broker::MockAccessBroker;
    use crate::config::QuotaConfig;
    use crate::wire::{self, cc, Header};

    #[test]
    fn connect_then_command_then_disconnect_round_trips() {
        let dispatcher = Dispatcher::new(MockAccessBroker::new(), QuotaConfig::default());
        let (handle, join) = Engine::spawn(dispatcher, "resmgr-test-worker");

        let conn = ConnectionId(7);
        handle.connect(conn);

        let mut cmd = Vec::new();
        Header { tag: 0x8001, size: 10, code: cc::GET_CAPABILITY }.write(&mut cmd);
        cmd.extend_from_slice(&wire::TPM2_CAP_HANDLES.to_be_bytes());
        cmd.extend_from_slice(&0x8000_0000u32.to_be_bytes());
        cmd.extend_from_slice(&16u32.to_be_bytes());

        let resp = handle.send_command(conn, cmd).expect("engine still running");
        assert_eq!(Header::parse(&resp).unwrap().code, wire::TPM2_RC_SUCCESS);

        handle.disconnect(conn);
        drop(handle);
        join.join().expect("worker thread panicked");
    }
}

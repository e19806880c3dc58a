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

//! A connection's external identity and its owned [`HandleMap`].

use crate::handle::HandleMap;

/// Opaque external connection identity. The resource manager never
/// dereferences this beyond equality comparison; it is supplied by
/// whatever connection manager sits above this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// A connected client: owns exactly one [`HandleMap`] of transient
/// objects. Sessions reference a connection only by [`ConnectionId`],
/// never by borrowing `Connection` itself.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub transients: HandleMap,
    pub session_cap: usize,
}

impl Connection {
    pub fn new(id: ConnectionId, transient_cap: usize, session_cap: usize) -> Connection {
        Connection { id, transients: HandleMap::new(transient_cap), session_cap }
    }
}

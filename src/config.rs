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

//! Per-connection quota configuration.
//!
//! This crate has no on-disk configuration format of its own: the daemon
//! embedding it owns configuration sources (files, CLI flags, D-Bus
//! properties) and constructs a [`QuotaConfig`] to pass in.

/// Per-connection resource caps enforced by the quota enforcer
#[derive(Debug, Clone, Copy)]
pub struct QuotaConfig {
    /// Maximum live transient objects per connection.
    pub transient_cap: usize,
    /// Maximum live sessions per connection.
    pub session_cap: usize,
}

impl Default for QuotaConfig {
    /// Matches tpm2-abrmd's historical defaults: 3 transient objects and
    /// 3 sessions per connection, the smallest quota that lets a typical
    /// client hold a primary key and a session concurrently plus one
    /// spare of each.
    fn default() -> QuotaConfig {
        QuotaConfig { transient_cap: 3, session_cap: 3 }
    }
}

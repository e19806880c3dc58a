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

//! Core command/response processing engine for a TPM 2.0 resource
//! manager: handle virtualisation, per-connection quotas, and session
//! ownership tracking in front of a physical TPM.
//!
//! This crate implements the broker core only. It has no opinion on
//! transport (D-Bus, a Unix socket, TCP) and no opinion on how the
//! physical TPM is actually reached — both are supplied by the embedding
//! daemon through the [`AccessBroker`](access_broker::AccessBroker) trait
//! and the [`Engine`](engine::Engine)/[`EngineHandle`](engine::EngineHandle)
//! pair.
//!
//! The pieces, roughly in dependency order:
//!
//! - [`wire`] — the subset of the TPM2 command/response wire format this
//!   crate needs to parse and rewrite.
//! - [`handle`] and [`session`] — the virtual/physical handle map and the
//!   process-wide session registry.
//! - [`connection`] and [`config`] — per-connection state and the quotas
//!   charged against it.
//! - [`access_broker`] — the trait boundary to the physical TPM.
//! - [`dispatcher`] — the per-command pipeline tying all of the above
//!   together.
//! - [`engine`] — the single worker thread that owns the dispatcher.

pub mod access_broker;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handle;
pub mod session;
pub mod wire;

pub use access_broker::AccessBroker;
pub use config::QuotaConfig;
pub use connection::ConnectionId;
pub use dispatcher::Dispatcher;
pub use engine::{Engine, EngineHandle};
pub use error::{ResmgrError, Result};

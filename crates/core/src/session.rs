// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Courier Contributors
//
// This file is part of Courier.
//
// Courier is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Courier is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Courier. If not, see <https://www.gnu.org/licenses/>.

//! Live session record and the directory seams.
//!
//! A live session is an open delivery channel currently held by exactly one
//! process instance for one connection. The local process keeps an
//! authoritative in-memory map of its own sessions; a shared-directory row
//! makes them visible fleet-wide so other instances can route hand-offs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a session from the perspective of this subsystem.
///
/// Courier always acts as the mailbox holder; the variant exists so session
/// records round-trip losslessly through the shared directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionRole {
    /// The instance holds the recipient's mailbox and delivers from it.
    MessageHolder,
}

/// An active delivery channel held by one process instance for one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSession {
    /// Session id assigned by the protocol layer.
    pub id: String,
    /// Connection this channel delivers to.
    pub connection_id: String,
    /// Pickup protocol version negotiated by the session layer.
    pub protocol_version: String,
    /// Role, always [`SessionRole::MessageHolder`] here.
    pub role: SessionRole,
    /// Instance currently holding the open channel.
    pub instance_id: String,
    /// Whether this record came from the local map (true) or the shared
    /// directory (false).
    pub is_local: bool,
}

/// Errors from the shared session directory backends.
#[derive(Debug, Error)]
pub enum SessionStoreError {
    /// Backend error (database, network, etc.)
    #[error("Session store backend error: {0}")]
    BackendError(String),
}

/// Lookup of sessions owned by the local process.
///
/// Implemented by the live-session directory; consumed by the mailbox
/// backends to decide whether a freshly enqueued envelope can skip the
/// `pending` window and be written as `sending`.
#[async_trait]
pub trait LocalSessionLookup: Send + Sync {
    /// Return the local live session for a connection, if this process holds one.
    async fn find_local_session(&self, connection_id: &str) -> Option<LiveSession>;
}

/// Fleet-visible session directory.
///
/// At most one authoritative record may exist per connection; `save` is an
/// upsert with last-write-wins semantics. A crash of the owning instance
/// leaves a stale record until explicit removal (or TTL expiry where the
/// backend supports it).
#[async_trait]
pub trait SharedSessionStore: Send + Sync {
    /// Insert or replace the directory record for the session's connection.
    async fn save(&self, session: &LiveSession) -> Result<(), SessionStoreError>;

    /// Fetch the directory record for a connection, tagged non-local.
    async fn find(&self, connection_id: &str) -> Result<Option<LiveSession>, SessionStoreError>;

    /// Delete the directory record for a connection (idempotent).
    async fn remove(&self, connection_id: &str) -> Result<(), SessionStoreError>;
}

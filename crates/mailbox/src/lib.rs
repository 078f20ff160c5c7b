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

//! # Courier Mailbox Store
//!
//! ## Purpose
//! Durable per-connection FIFO queue of pending encrypted envelopes. Messages
//! addressed to an offline recipient wait here until the recipient reconnects
//! (to any instance of the fleet) and drains its queue.
//!
//! ## Backends
//! - **Postgres** (`postgres-backend` feature): relational backend with an
//!   atomic claim (`UPDATE … WHERE state = 'pending' … RETURNING`); also
//!   hosts the shared live-session directory table
//! - **DynamoDB** (`dynamodb-backend` feature): partitioned key-value backend
//!   (partition key = connection id, sort key = arrival-ordered id) with
//!   conditional-write claims
//! - **InMemory**: always available, for tests and single-node deployments
//!
//! Backend selection happens at startup via [`MailboxConfig`] — a single
//! trait with multiple implementations, never inheritance.
//!
//! ## Delivery guarantees
//! At-least-once: an envelope claimed into `sending` that is never confirmed
//! delivered is reset to `pending` by [`MailboxStore::requeue_in_flight`]
//! when the holding session disappears. Exactly-once is a non-goal.

#![warn(missing_docs)]
#![warn(clippy::all)]

use async_trait::async_trait;
use courier_core::{LocalSessionLookup, QueuedEnvelope};
use std::sync::Arc;

pub mod config;
pub mod error;
pub mod memory;

#[cfg(feature = "postgres-backend")]
pub mod postgres;

#[cfg(feature = "dynamodb-backend")]
pub mod dynamodb;

pub use config::{create_mailbox_from_config, create_mailbox_from_env, MailboxBackend, MailboxConfig};
pub use error::{MailboxError, MailboxResult};
pub use memory::InMemoryMailbox;

#[cfg(feature = "postgres-backend")]
pub use postgres::PostgresMailbox;

#[cfg(feature = "dynamodb-backend")]
pub use dynamodb::DynamoDbMailbox;

/// Options for [`MailboxStore::take_from_queue`].
#[derive(Debug, Clone)]
pub struct TakeFromQueueOptions {
    /// Connection whose mailbox is drained.
    pub connection_id: String,
    /// Maximum number of envelopes to return (`None` = all available).
    pub limit: Option<usize>,
    /// `true`: return and delete the matched envelopes without a state
    /// transition. `false`: atomically claim them `pending → sending`.
    pub delete_messages: bool,
    /// Optional recipient identifier; envelopes match by connection id OR by
    /// membership of this identifier in their recipient set.
    pub recipient_did: Option<String>,
}

/// Options for [`MailboxStore::add_message`].
#[derive(Debug, Clone)]
pub struct AddMessageOptions {
    /// Connection the envelope is addressed to.
    pub connection_id: String,
    /// Logical recipient identifiers carried by the envelope.
    pub recipient_dids: Vec<String>,
    /// Opaque encrypted envelope bytes; never parsed by this crate.
    pub payload: Vec<u8>,
}

/// Mailbox store contract, identical across backends.
///
/// ## Error shape
/// The read paths (`get_available_message_count`, `take_from_queue`) are
/// best-effort by contract: transient backend failures are logged and
/// surfaced as `0` / empty, because every caller treats "nothing to deliver"
/// and "backend briefly down" the same way. Callers must therefore not use
/// an empty result to conclude the mailbox is empty. The write paths
/// (`add_message`, `remove_messages`, `requeue_in_flight`) propagate errors,
/// since callers must know a durable write failed.
#[async_trait]
pub trait MailboxStore: Send + Sync {
    /// Count of `pending` envelopes for a connection.
    async fn get_available_message_count(&self, connection_id: &str) -> u64;

    /// Fetch (and claim or delete) queued envelopes, ordered by `received_at`
    /// ascending.
    ///
    /// With `delete_messages = false` this is an exclusive claim: no two
    /// concurrent callers may receive the same envelope, enforced by a single
    /// atomic statement (or conditional write) in every backend.
    async fn take_from_queue(&self, options: TakeFromQueueOptions) -> Vec<QueuedEnvelope>;

    /// Durably insert an envelope and return its backend-assigned id.
    ///
    /// The envelope is written with state `sending` when the bound
    /// [`LocalSessionLookup`] reports a local live session at enqueue time
    /// (it is immediately claimed for delivery and skips the `pending`
    /// window), else `pending`. After the write commits, a
    /// `GatewayEvent::MessageQueued` is published — write-then-notify, never
    /// the reverse.
    async fn add_message(&self, options: AddMessageOptions) -> MailboxResult<String>;

    /// Delete envelopes by id, scoped to the connection. Absent ids are
    /// ignored; removing an already-removed id is a no-op, not an error.
    async fn remove_messages(&self, connection_id: &str, message_ids: &[String])
        -> MailboxResult<()>;

    /// Reconciliation sweep: reset every `sending` envelope of the connection
    /// back to `pending` and return how many were reset. Idempotent — a
    /// connection with no outstanding `sending` rows is a no-op.
    async fn requeue_in_flight(&self, connection_id: &str) -> MailboxResult<u64>;

    /// Bind the local-session lookup consulted by `add_message`.
    ///
    /// Called once during wiring, after the live-session directory exists
    /// (the directory in turn holds this store, so neither can be constructed
    /// with the other). Before binding, `add_message` writes `pending`.
    fn bind_session_lookup(&self, lookup: Arc<dyn LocalSessionLookup>);
}

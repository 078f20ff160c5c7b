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

//! # Courier Delivery Bus
//!
//! ## Purpose
//! Cross-instance hand-off: when a message for a connection is queued on
//! instance A but the recipient's live session is held by instance B, A
//! publishes a hand-off to B's inbox stream and B drains the recipient's
//! mailbox over its open channel.
//!
//! ## Model
//! - **Registry**: `connection → instance` ownership records with a TTL, so
//!   a crashed instance's claims expire instead of lingering forever
//! - **Per-instance inbox stream**: each instance consumes only its own
//!   stream through a consumer group; an entry is acknowledged only after
//!   the handler succeeds (at-least-once)
//! - **Recovery**: every instance periodically claims entries that sat
//!   unacknowledged in *other* instances' streams past an idle threshold,
//!   so work owned by a dead instance is eventually redelivered
//!
//! The hand-off payload carries only the connection id. The mailbox is the
//! single source of truth for message content; losing a hand-off delays
//! delivery but never loses a message.

#![warn(missing_docs)]
#![warn(clippy::all)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub mod config;
pub mod error;
pub mod memory;

#[cfg(feature = "redis-backend")]
pub mod redis_bus;

pub use config::{create_bus_from_config, create_bus_from_env, BusBackend, BusConfig};
pub use error::{BusError, BusResult};
pub use memory::{BusNetwork, InMemoryDeliveryBus};

#[cfg(feature = "redis-backend")]
pub use redis_bus::RedisDeliveryBus;

/// Hand-off notice published to another instance's inbox stream.
///
/// Deliberately thin: the receiving instance re-reads the mailbox, which is
/// authoritative for content and order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffMessage {
    /// Connection whose mailbox should be drained by the receiver.
    pub connection_id: String,
}

/// Consumer callback for hand-off messages.
///
/// Returning `Ok` acknowledges the entry; returning `Err` leaves it pending
/// so it is redelivered (to this instance or to a recovering peer).
#[async_trait]
pub trait HandoffHandler: Send + Sync {
    /// Process one hand-off. `origin_instance` is the instance whose stream
    /// carried the entry (differs from the local instance during recovery).
    async fn handle(&self, message: HandoffMessage, origin_instance: &str) -> BusResult<()>;
}

/// Cross-instance delivery bus contract.
#[async_trait]
pub trait DeliveryBus: Send + Sync {
    /// Stable id of the local instance.
    fn instance_id(&self) -> &str;

    /// Record this instance as the live-session owner for a connection.
    /// Overwrites any previous owner; the record expires after the registry
    /// TTL unless refreshed by re-registration.
    async fn register_connection(&self, connection_id: &str) -> BusResult<()>;

    /// Drop the ownership record for a connection (idempotent).
    async fn unregister_connection(&self, connection_id: &str) -> BusResult<()>;

    /// Look up which instance currently claims a connection, if any.
    async fn connection_instance(&self, connection_id: &str) -> BusResult<Option<String>>;

    /// Append a hand-off to the target instance's inbox stream and return
    /// the entry id.
    async fn send_to_instance(
        &self,
        instance_id: &str,
        message: HandoffMessage,
    ) -> BusResult<String>;

    /// Number of delivered-but-unacknowledged entries in an instance's
    /// stream.
    async fn pending_count(&self, instance_id: &str) -> BusResult<u64>;

    /// Consume the local inbox stream until `shutdown` flips to true.
    ///
    /// Entries are acknowledged only after `handler` returns `Ok`; handler
    /// failures are logged and the entry stays pending. Undecodable entries
    /// are acknowledged and skipped so they cannot wedge the stream.
    async fn listen(
        &self,
        handler: Arc<dyn HandoffHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> BusResult<()>;

    /// One recovery sweep: claim entries abandoned in other instances'
    /// streams and run them through `handler`. Returns how many entries were
    /// processed.
    async fn claim_abandoned(&self, handler: Arc<dyn HandoffHandler>) -> BusResult<u64>;

    /// Periodic recovery driver around [`DeliveryBus::claim_abandoned`].
    async fn run_claim_loop(
        &self,
        handler: Arc<dyn HandoffHandler>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.claim_abandoned(handler.clone()).await {
                        Ok(claimed) if claimed > 0 => {
                            tracing::info!(claimed, "Recovered abandoned hand-offs");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!("Recovery sweep failed: {}", err);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender means the owner is gone; shut down
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("Claim loop shutting down");
                        return;
                    }
                }
            }
        }
    }
}

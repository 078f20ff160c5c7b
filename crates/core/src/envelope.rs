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

//! Queued envelope record and its lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a queued envelope.
///
/// ## Invariants
/// - `Pending` envelopes are claimable by any instance
/// - `Sending` envelopes are claimed by exactly one take-operation and are
///   reset to `Pending` by reconciliation if the holding session disappears
///   before the envelope is acknowledged and removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeState {
    /// Waiting in the mailbox, claimable.
    Pending,
    /// Claimed for delivery but not yet confirmed delivered and removed.
    Sending,
}

impl EnvelopeState {
    /// Stable string form used by the storage backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeState::Pending => "pending",
            EnvelopeState::Sending => "sending",
        }
    }

    /// Parse the storage string form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EnvelopeState::Pending),
            "sending" => Some(EnvelopeState::Sending),
            _ => None,
        }
    }
}

impl std::fmt::Display for EnvelopeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One encrypted message waiting in a connection's mailbox.
///
/// The `encrypted_message` payload is an opaque blob: Courier never parses
/// it, only stores and forwards it. Per-connection delivery order follows
/// `received_at` ascending; no ordering is guaranteed across connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEnvelope {
    /// Backend-assigned unique id (UUID for the relational backend, a
    /// timestamp-prefixed composite for the key-value backend).
    pub id: String,
    /// Owning connection (partition/shard key).
    pub connection_id: String,
    /// Logical recipient identifiers; a message may match a take-operation by
    /// connection id OR by membership in this set.
    pub recipient_dids: Vec<String>,
    /// Opaque encrypted envelope bytes.
    #[serde(with = "serde_bytes_compat")]
    pub encrypted_message: Vec<u8>,
    /// Lifecycle state.
    pub state: EnvelopeState,
    /// Enqueue timestamp; defines per-connection delivery order.
    pub received_at: DateTime<Utc>,
}

/// Serialize the opaque payload as a plain byte array so the wire shape stays
/// stable across serde versions.
mod serde_bytes_compat {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        assert_eq!(EnvelopeState::parse("pending"), Some(EnvelopeState::Pending));
        assert_eq!(EnvelopeState::parse("sending"), Some(EnvelopeState::Sending));
        assert_eq!(EnvelopeState::parse("delivered"), None);
        assert_eq!(EnvelopeState::Pending.as_str(), "pending");
        assert_eq!(EnvelopeState::Sending.to_string(), "sending");
    }
}

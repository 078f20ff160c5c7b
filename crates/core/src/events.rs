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

//! Typed gateway event bus.
//!
//! ## Purpose
//! In-process fan-out of the three lifecycle signals this subsystem reacts
//! to: a message was durably queued, a live session opened, a live session
//! closed. A typed enum over a broadcast channel keeps handler registration
//! statically checked instead of stringly-typed.
//!
//! ## Ordering
//! Events are emitted strictly after the durable write they describe
//! (write-then-notify); a subscriber never observes a `MessageQueued` for a
//! write that did not commit.

use crate::envelope::QueuedEnvelope;
use crate::session::LiveSession;
use tokio::sync::broadcast;
use tracing::debug;

/// Lifecycle events flowing between the mailbox, directory and orchestrator.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// An envelope was durably written to the mailbox. Carries the full
    /// envelope: one written as `Sending` (a local live session existed at
    /// enqueue time) is already claimed, so its consumer delivers it from
    /// the event instead of re-claiming from the store.
    MessageQueued(QueuedEnvelope),
    /// A recipient's delivery channel opened on this instance.
    SessionSaved(LiveSession),
    /// A recipient's delivery channel closed on this instance.
    SessionRemoved {
        /// Connection whose channel closed.
        connection_id: String,
    },
}

/// Cloneable handle to the in-process gateway event stream.
///
/// Backed by a tokio broadcast channel: publishing never blocks, and slow
/// subscribers that fall behind the channel capacity lose the oldest events
/// (lagging is surfaced by the receiver, and every consumer in this subsystem
/// treats events as hints over durable state, so a lost event is repaired by
/// the reconciliation paths).
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    /// Create a bus with the given subscriber backlog capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// A bus with no subscribers drops the event silently; that is the normal
    /// state during startup and teardown.
    pub fn publish(&self, event: GatewayEvent) {
        if let Err(err) = self.sender.send(event) {
            debug!("No gateway event subscribers, dropping event: {:?}", err.0);
        }
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeState;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(GatewayEvent::MessageQueued(QueuedEnvelope {
            id: "m1".to_string(),
            connection_id: "c1".to_string(),
            recipient_dids: vec![],
            encrypted_message: b"payload".to_vec(),
            state: EnvelopeState::Pending,
            received_at: chrono::Utc::now(),
        }));

        match rx.recv().await.unwrap() {
            GatewayEvent::MessageQueued(envelope) => {
                assert_eq!(envelope.id, "m1");
                assert_eq!(envelope.connection_id, "c1");
                assert_eq!(envelope.state, EnvelopeState::Pending);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        // Must not panic or error
        bus.publish(GatewayEvent::SessionRemoved {
            connection_id: "c1".to_string(),
        });
    }
}

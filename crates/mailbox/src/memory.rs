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

//! In-memory mailbox backend.
//!
//! ## Purpose
//! Always-available [`MailboxStore`] implementation for tests and
//! single-node deployments. All operations take the single internal lock, so
//! the claim transition is trivially atomic.

use crate::{AddMessageOptions, MailboxResult, MailboxStore, TakeFromQueueOptions};
use async_trait::async_trait;
use chrono::Utc;
use courier_core::{EnvelopeState, EventBus, GatewayEvent, LocalSessionLookup, QueuedEnvelope};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::debug;

/// HashMap-free in-memory mailbox: a single vector guarded by a mutex.
///
/// The envelope set is small in every scenario this backend serves, and a
/// flat vector keeps the `recipient_did` OR-match identical to the relational
/// backend's query semantics.
pub struct InMemoryMailbox {
    envelopes: Mutex<Vec<QueuedEnvelope>>,
    events: EventBus,
    session_lookup: OnceLock<Arc<dyn LocalSessionLookup>>,
}

impl InMemoryMailbox {
    /// Create an empty mailbox publishing to the given event bus.
    pub fn new(events: EventBus) -> Self {
        Self {
            envelopes: Mutex::new(Vec::new()),
            events,
            session_lookup: OnceLock::new(),
        }
    }

    fn matches(envelope: &QueuedEnvelope, connection_id: &str, recipient_did: Option<&str>) -> bool {
        envelope.connection_id == connection_id
            || recipient_did
                .map(|did| envelope.recipient_dids.iter().any(|d| d == did))
                .unwrap_or(false)
    }
}

impl Default for InMemoryMailbox {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}

#[async_trait]
impl MailboxStore for InMemoryMailbox {
    async fn get_available_message_count(&self, connection_id: &str) -> u64 {
        let envelopes = self.envelopes.lock().await;
        envelopes
            .iter()
            .filter(|e| e.connection_id == connection_id && e.state == EnvelopeState::Pending)
            .count() as u64
    }

    async fn take_from_queue(&self, options: TakeFromQueueOptions) -> Vec<QueuedEnvelope> {
        let mut envelopes = self.envelopes.lock().await;

        let mut matched: Vec<usize> = envelopes
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.state == EnvelopeState::Pending
                    && Self::matches(e, &options.connection_id, options.recipient_did.as_deref())
            })
            .map(|(i, _)| i)
            .collect();
        matched.sort_by(|a, b| envelopes[*a].received_at.cmp(&envelopes[*b].received_at));
        matched.truncate(options.limit.unwrap_or(usize::MAX));

        if options.delete_messages {
            let taken: Vec<QueuedEnvelope> = matched.iter().map(|&i| envelopes[i].clone()).collect();
            let ids: Vec<&str> = taken.iter().map(|e| e.id.as_str()).collect();
            envelopes.retain(|e| !ids.contains(&e.id.as_str()));
            taken
        } else {
            matched
                .into_iter()
                .map(|i| {
                    envelopes[i].state = EnvelopeState::Sending;
                    envelopes[i].clone()
                })
                .collect()
        }
    }

    async fn add_message(&self, options: AddMessageOptions) -> MailboxResult<String> {
        let local_session = match self.session_lookup.get() {
            Some(lookup) => lookup.find_local_session(&options.connection_id).await,
            None => None,
        };
        let state = if local_session.is_some() {
            EnvelopeState::Sending
        } else {
            EnvelopeState::Pending
        };

        let envelope = QueuedEnvelope {
            id: ulid::Ulid::new().to_string(),
            connection_id: options.connection_id.clone(),
            recipient_dids: options.recipient_dids,
            encrypted_message: options.payload,
            state,
            received_at: Utc::now(),
        };
        let id = envelope.id.clone();

        self.envelopes.lock().await.push(envelope.clone());

        debug!(
            connection_id = %options.connection_id,
            message_id = %id,
            state = %state,
            "Queued message in memory"
        );
        self.events.publish(GatewayEvent::MessageQueued(envelope));

        Ok(id)
    }

    async fn remove_messages(
        &self,
        connection_id: &str,
        message_ids: &[String],
    ) -> MailboxResult<()> {
        if message_ids.is_empty() {
            return Ok(());
        }

        let mut envelopes = self.envelopes.lock().await;
        envelopes.retain(|e| !(e.connection_id == connection_id && message_ids.contains(&e.id)));
        Ok(())
    }

    async fn requeue_in_flight(&self, connection_id: &str) -> MailboxResult<u64> {
        let mut envelopes = self.envelopes.lock().await;
        let mut reset = 0u64;
        for envelope in envelopes.iter_mut() {
            if envelope.connection_id == connection_id && envelope.state == EnvelopeState::Sending {
                envelope.state = EnvelopeState::Pending;
                reset += 1;
            }
        }
        Ok(reset)
    }

    fn bind_session_lookup(&self, lookup: Arc<dyn LocalSessionLookup>) {
        let _ = self.session_lookup.set(lookup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_options(connection_id: &str) -> AddMessageOptions {
        AddMessageOptions {
            connection_id: connection_id.to_string(),
            recipient_dids: vec![format!("did:{}", connection_id)],
            payload: b"{\"protected\":\"...\"}".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_take_matches_by_recipient_did() {
        let mailbox = InMemoryMailbox::default();
        mailbox.add_message(add_options("c1")).await.unwrap();

        let taken = mailbox
            .take_from_queue(TakeFromQueueOptions {
                connection_id: "other-connection".to_string(),
                limit: None,
                delete_messages: false,
                recipient_did: Some("did:c1".to_string()),
            })
            .await;

        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].state, EnvelopeState::Sending);
    }

    #[tokio::test]
    async fn test_remove_unknown_id_is_noop() {
        let mailbox = InMemoryMailbox::default();
        let id = mailbox.add_message(add_options("c1")).await.unwrap();

        mailbox
            .remove_messages("c1", &["does-not-exist".to_string()])
            .await
            .unwrap();

        assert_eq!(mailbox.get_available_message_count("c1").await, 1);
        mailbox.remove_messages("c1", &[id]).await.unwrap();
        assert_eq!(mailbox.get_available_message_count("c1").await, 0);
    }
}

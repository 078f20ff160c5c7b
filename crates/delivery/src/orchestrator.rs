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

//! Delivery orchestrator.
//!
//! ## Decision ladder
//! For every queued message, in order:
//! 1. **Local**: the recipient's channel is held by this process → claim a
//!    batch from the mailbox, deliver over the channel, remove on success.
//! 2. **Remote**: the bus registry names another instance → publish a
//!    hand-off to its inbox stream. A registry record naming *this* instance
//!    while no local session exists is stale (a crash left it behind) and is
//!    deleted before falling through.
//! 3. **Fallback**: nobody holds a channel → out-of-band notification. The
//!    envelope stays queued; notification happens only after delivery is
//!    ruled out, never alongside it.
//!
//! The same ladder minus the remote rung runs for incoming hand-offs: by the
//! time one arrives here, either this instance holds the session or the
//! sender's view was stale.

use crate::{
    DeliveryConfig, DeliveryResult, ForwardingStrategy, LiveSessionDirectory,
    NotificationFallback,
};
use async_trait::async_trait;
use courier_bus::{BusError, BusResult, DeliveryBus, HandoffHandler, HandoffMessage};
use courier_core::{EnvelopeState, EventBus, GatewayEvent, LiveSession, QueuedEnvelope};
use courier_mailbox::{MailboxStore, TakeFromQueueOptions};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Protocol-layer delivery channel seam.
///
/// Implementations push envelopes over the session's open transport
/// (websocket, long-poll response, …). An error means nothing in the batch
/// is confirmed delivered; the claimed envelopes are left for
/// reconciliation.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Deliver a batch of envelopes over the session's channel.
    async fn deliver(
        &self,
        session: &LiveSession,
        envelopes: &[QueuedEnvelope],
    ) -> DeliveryResult<()>;
}

/// Routes queued messages to a live channel, a peer instance, or the
/// notification fallback.
pub struct DeliveryOrchestrator {
    mailbox: Arc<dyn MailboxStore>,
    directory: Arc<LiveSessionDirectory>,
    bus: Arc<dyn DeliveryBus>,
    transport: Arc<dyn SessionTransport>,
    notifier: Arc<NotificationFallback>,
    events: EventBus,
    config: DeliveryConfig,
}

impl DeliveryOrchestrator {
    /// Wire up the orchestrator over its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mailbox: Arc<dyn MailboxStore>,
        directory: Arc<LiveSessionDirectory>,
        bus: Arc<dyn DeliveryBus>,
        transport: Arc<dyn SessionTransport>,
        notifier: Arc<NotificationFallback>,
        events: EventBus,
        config: DeliveryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            mailbox,
            directory,
            bus,
            transport,
            notifier,
            events,
            config,
        })
    }

    /// Run the decision ladder for a freshly queued message.
    pub async fn handle_message_queued(&self, envelope: &QueuedEnvelope) {
        let connection_id = &envelope.connection_id;

        // Rung 1: local. A Sending envelope was claimed at enqueue time
        // because a local session existed, so it is delivered straight from
        // the event; under QueueOnly the first local attempt is ours and
        // goes through a regular claim.
        if envelope.state == EnvelopeState::Sending {
            if let Some(session) = self.directory.find_local_live_session(connection_id).await {
                let result = self
                    .deliver_claimed(&session, std::slice::from_ref(envelope))
                    .await;
                match result {
                    Ok(()) => {
                        // Pick up anything else that accumulated
                        if let Err(err) = self.drain_session(&session).await {
                            warn!(
                                connection_id = %connection_id,
                                "Drain after delivery failed: {}", err
                            );
                        }
                    }
                    Err(err) => {
                        warn!(
                            connection_id = %connection_id,
                            "Local delivery failed, falling back to notification: {}", err
                        );
                        self.notifier.notify(connection_id).await;
                    }
                }
                return;
            }
            // The session closed between the write and this event; teardown
            // reconciliation requeues the claimed envelope. Fall through.
        } else if self.config.forwarding_strategy == ForwardingStrategy::QueueOnly {
            if let Some(session) = self.directory.find_local_live_session(connection_id).await {
                match self.drain_session(&session).await {
                    Ok(_) => return,
                    Err(err) => {
                        warn!(
                            connection_id = %connection_id,
                            "Local delivery failed, falling back to notification: {}", err
                        );
                        self.notifier.notify(connection_id).await;
                        return;
                    }
                }
            }
        }

        // Rung 2: remote.
        let owner = match self.bus.connection_instance(connection_id).await {
            Ok(owner) => owner,
            Err(err) => {
                error!(connection_id = %connection_id, "Registry lookup failed: {}", err);
                None
            }
        };

        match owner {
            Some(owner) if owner == self.bus.instance_id() => {
                if let Some(session) = self.directory.find_local_live_session(connection_id).await
                {
                    if let Err(err) = self.drain_session(&session).await {
                        warn!(
                            connection_id = %connection_id,
                            "Local delivery failed, falling back to notification: {}", err
                        );
                        self.notifier.notify(connection_id).await;
                    }
                    return;
                }
                // Registry says us, local map says no: the record outlived
                // its session
                debug!(connection_id = %connection_id, "Dropping stale registry record");
                if let Err(err) = self.bus.unregister_connection(connection_id).await {
                    warn!(connection_id = %connection_id, "Failed to drop stale record: {}", err);
                }
                self.notifier.notify(connection_id).await;
            }
            Some(owner) => {
                let handoff = HandoffMessage {
                    connection_id: connection_id.to_string(),
                };
                match self.bus.send_to_instance(&owner, handoff).await {
                    Ok(entry_id) => {
                        debug!(
                            connection_id = %connection_id,
                            target_instance = %owner,
                            entry_id = %entry_id,
                            "Handed off to session owner"
                        );
                    }
                    Err(err) => {
                        warn!(
                            connection_id = %connection_id,
                            target_instance = %owner,
                            "Hand-off failed, falling back to notification: {}", err
                        );
                        self.notifier.notify(connection_id).await;
                    }
                }
            }
            None => {
                // Rung 3: nobody holds a channel
                self.notifier.notify(connection_id).await;
            }
        }
    }

    /// Deliver already-claimed envelopes and confirm by removing them.
    async fn deliver_claimed(
        &self,
        session: &LiveSession,
        envelopes: &[QueuedEnvelope],
    ) -> DeliveryResult<()> {
        self.transport.deliver(session, envelopes).await?;
        let ids: Vec<String> = envelopes.iter().map(|e| e.id.clone()).collect();
        self.mailbox
            .remove_messages(&session.connection_id, &ids)
            .await?;
        metrics::counter!("courier_messages_delivered_total").increment(ids.len() as u64);
        Ok(())
    }

    /// Claim-and-deliver until the connection's mailbox is empty.
    ///
    /// Returns how many envelopes were confirmed delivered. On a transport
    /// error the current claimed batch stays `sending`; session teardown or
    /// the recovery sweep requeues it.
    pub async fn drain_session(&self, session: &LiveSession) -> DeliveryResult<u64> {
        let mut delivered = 0u64;
        loop {
            let envelopes = self
                .mailbox
                .take_from_queue(TakeFromQueueOptions {
                    connection_id: session.connection_id.clone(),
                    limit: Some(self.config.batch_size),
                    delete_messages: false,
                    recipient_did: None,
                })
                .await;
            if envelopes.is_empty() {
                if delivered > 0 {
                    info!(
                        connection_id = %session.connection_id,
                        delivered,
                        "Drained mailbox"
                    );
                }
                return Ok(delivered);
            }

            self.deliver_claimed(session, &envelopes).await?;
            delivered += envelopes.len() as u64;
        }
    }

    /// React to gateway events until `shutdown` flips to true.
    ///
    /// `MessageQueued` runs the ladder; `SessionSaved` drains whatever
    /// accumulated while the recipient was offline. Lost events are repaired
    /// by the same drain on the next session open, so a lagging subscription
    /// is logged and survived.
    pub async fn run_event_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.events.subscribe();
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                changed = shutdown.changed() => {
                    // A dropped sender means the owner is gone; shut down
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Orchestrator event loop shutting down");
                        return;
                    }
                    continue;
                }
            };

            match event {
                Ok(GatewayEvent::MessageQueued(envelope)) => {
                    self.handle_message_queued(&envelope).await;
                }
                Ok(GatewayEvent::SessionSaved(session)) => {
                    if self.mailbox.get_available_message_count(&session.connection_id).await > 0 {
                        if let Err(err) = self.drain_session(&session).await {
                            warn!(
                                connection_id = %session.connection_id,
                                "Failed to drain on session open: {}", err
                            );
                        }
                    }
                }
                Ok(GatewayEvent::SessionRemoved { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Orchestrator lagged behind the event stream");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    debug!("Gateway event stream closed, stopping orchestrator");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl HandoffHandler for DeliveryOrchestrator {
    /// Incoming hand-off: either this instance holds the session now, or the
    /// sender's registry view was stale.
    async fn handle(&self, message: HandoffMessage, origin_instance: &str) -> BusResult<()> {
        let connection_id = &message.connection_id;
        debug!(
            connection_id = %connection_id,
            origin_instance = %origin_instance,
            "Received hand-off"
        );

        match self.directory.find_local_live_session(connection_id).await {
            Some(session) => match self.drain_session(&session).await {
                Ok(_) => Ok(()),
                // Leave the entry pending; redelivery retries the drain
                Err(err) => Err(BusError::HandlerError(err.to_string())),
            },
            None => {
                // Session closed between hand-off and processing; ack the
                // entry and fall back, the mailbox still holds everything
                self.notifier.notify(connection_id).await;
                Ok(())
            }
        }
    }
}

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

//! End-to-end delivery scenarios over the in-memory backends: one or two
//! simulated instances sharing a mailbox, a session store and a bus network.

use async_trait::async_trait;
use courier_bus::{BusNetwork, DeliveryBus, HandoffHandler, InMemoryDeliveryBus};
use courier_core::{
    EnvelopeState, EventBus, GatewayEvent, LiveSession, QueuedEnvelope, SessionRole,
    SharedSessionStore,
};
use courier_delivery::{
    DeliveryConfig, DeliveryError, DeliveryOrchestrator, DeliveryResult, InMemoryNotificationStore,
    InMemorySessionStore, LiveSessionDirectory, NotificationFallback, NotificationRecord,
    NotifyError, PushGateway, SessionTransport,
};
use courier_mailbox::{AddMessageOptions, InMemoryMailbox, MailboxStore, TakeFromQueueOptions};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct RecordingTransport {
    delivered: Mutex<Vec<QueuedEnvelope>>,
    fail: AtomicBool,
}

impl RecordingTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    fn delivered(&self) -> Vec<QueuedEnvelope> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionTransport for RecordingTransport {
    async fn deliver(
        &self,
        _session: &LiveSession,
        envelopes: &[QueuedEnvelope],
    ) -> DeliveryResult<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(DeliveryError::Transport("channel broke".to_string()));
        }
        self.delivered.lock().unwrap().extend_from_slice(envelopes);
        Ok(())
    }
}

struct CountingGateway {
    sends: AtomicUsize,
}

#[async_trait]
impl PushGateway for CountingGateway {
    async fn send(
        &self,
        _project_id: &str,
        _device_token: &str,
        _title: &str,
        _body: &str,
    ) -> Result<(), NotifyError> {
        self.sends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// One simulated instance: directory + orchestrator over shared stores.
struct Instance {
    mailbox: Arc<InMemoryMailbox>,
    directory: Arc<LiveSessionDirectory>,
    bus: Arc<InMemoryDeliveryBus>,
    transport: Arc<RecordingTransport>,
    gateway: Arc<CountingGateway>,
    orchestrator: Arc<DeliveryOrchestrator>,
    events: EventBus,
}

impl Instance {
    async fn build(
        instance_id: &str,
        network: Arc<BusNetwork>,
        mailbox: Arc<InMemoryMailbox>,
        shared_sessions: Arc<dyn SharedSessionStore>,
        events: EventBus,
    ) -> Self {
        let bus: Arc<InMemoryDeliveryBus> = Arc::new(InMemoryDeliveryBus::new(
            network,
            instance_id.to_string(),
        ));
        let directory = LiveSessionDirectory::new(
            shared_sessions,
            mailbox.clone(),
            bus.clone(),
            events.clone(),
        );
        mailbox.bind_session_lookup(directory.clone());

        let transport = RecordingTransport::new();
        let gateway = Arc::new(CountingGateway {
            sends: AtomicUsize::new(0),
        });
        let notification_store = Arc::new(InMemoryNotificationStore::new());
        notification_store
            .insert(NotificationRecord {
                connection_id: "c1".to_string(),
                device_token: Some("token".to_string()),
                push_project_id: None,
            })
            .await;

        let config = DeliveryConfig {
            push_project_ids: vec!["project-a".to_string()],
            ..Default::default()
        };
        let notifier = Arc::new(NotificationFallback::new(
            Some(gateway.clone()),
            notification_store,
            config.clone(),
        ));
        let orchestrator = DeliveryOrchestrator::new(
            mailbox.clone(),
            directory.clone(),
            bus.clone(),
            transport.clone(),
            notifier,
            events.clone(),
            config,
        );

        Self {
            mailbox,
            directory,
            bus,
            transport,
            gateway,
            orchestrator,
            events,
        }
    }

    /// Queue a message and run the orchestrator ladder on the resulting
    /// event, the way the event loop would.
    async fn queue_and_route(&self, connection_id: &str, payload: &[u8]) -> QueuedEnvelope {
        let mut rx = self.events.subscribe();
        self.mailbox
            .add_message(AddMessageOptions {
                connection_id: connection_id.to_string(),
                recipient_dids: vec![],
                payload: payload.to_vec(),
            })
            .await
            .unwrap();
        let envelope = match rx.recv().await.unwrap() {
            GatewayEvent::MessageQueued(envelope) => envelope,
            other => panic!("Unexpected event: {:?}", other),
        };
        self.orchestrator.handle_message_queued(&envelope).await;
        envelope
    }
}

fn session(connection_id: &str) -> LiveSession {
    LiveSession {
        id: format!("session-{}", connection_id),
        connection_id: connection_id.to_string(),
        protocol_version: "v2".to_string(),
        role: SessionRole::MessageHolder,
        instance_id: String::new(),
        is_local: false,
    }
}

#[tokio::test]
async fn test_offline_recipient_keeps_message_and_notifies_once() {
    let events = EventBus::default();
    let mailbox = Arc::new(InMemoryMailbox::new(events.clone()));
    let instance = Instance::build(
        "a",
        BusNetwork::new(),
        mailbox.clone(),
        Arc::new(InMemorySessionStore::new()),
        events,
    )
    .await;

    let envelope = instance.queue_and_route("c1", b"hello").await;
    assert_eq!(envelope.state, EnvelopeState::Pending);

    // Nobody delivered, exactly one notification, message still queued
    assert!(instance.transport.delivered().is_empty());
    assert_eq!(instance.gateway.sends.load(Ordering::Relaxed), 1);
    assert_eq!(mailbox.get_available_message_count("c1").await, 1);
}

#[tokio::test]
async fn test_local_session_delivers_and_removes() {
    let events = EventBus::default();
    let mailbox = Arc::new(InMemoryMailbox::new(events.clone()));
    let instance = Instance::build(
        "a",
        BusNetwork::new(),
        mailbox.clone(),
        Arc::new(InMemorySessionStore::new()),
        events,
    )
    .await;

    instance.directory.session_saved(session("c1")).await.unwrap();

    let envelope = instance.queue_and_route("c1", b"hello").await;
    // Local session existed at enqueue time, so the envelope skipped pending
    assert_eq!(envelope.state, EnvelopeState::Sending);

    let delivered = instance.transport.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].encrypted_message, b"hello");

    // Confirmed delivery removed the envelope; no fallback fired
    assert_eq!(mailbox.get_available_message_count("c1").await, 0);
    assert!(mailbox
        .take_from_queue(TakeFromQueueOptions {
            connection_id: "c1".to_string(),
            limit: None,
            delete_messages: false,
            recipient_did: None,
        })
        .await
        .is_empty());
    assert_eq!(instance.gateway.sends.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_transport_failure_falls_back_and_keeps_message_claimable() {
    let events = EventBus::default();
    let mailbox = Arc::new(InMemoryMailbox::new(events.clone()));
    let instance = Instance::build(
        "a",
        BusNetwork::new(),
        mailbox.clone(),
        Arc::new(InMemorySessionStore::new()),
        events,
    )
    .await;

    instance.directory.session_saved(session("c1")).await.unwrap();
    instance.transport.fail.store(true, Ordering::Relaxed);

    instance.queue_and_route("c1", b"hello").await;

    // Delivery failed: notified, envelope still claimed
    assert_eq!(instance.gateway.sends.load(Ordering::Relaxed), 1);
    assert_eq!(mailbox.get_available_message_count("c1").await, 0);

    // Session teardown reconciles the stranded claim back to pending
    instance.directory.session_removed("c1").await.unwrap();
    assert_eq!(mailbox.get_available_message_count("c1").await, 1);

    // A reconnect can claim it again
    instance.transport.fail.store(false, Ordering::Relaxed);
    instance.directory.session_saved(session("c1")).await.unwrap();
    let local = instance.directory.find_local_live_session("c1").await.unwrap();
    assert_eq!(instance.orchestrator.drain_session(&local).await.unwrap(), 1);
    assert_eq!(instance.transport.delivered().len(), 1);
    assert_eq!(mailbox.get_available_message_count("c1").await, 0);
}

#[tokio::test]
async fn test_remote_session_hands_off_to_owner_instance() {
    let network = BusNetwork::new();
    let events = EventBus::default();
    let mailbox = Arc::new(InMemoryMailbox::new(events.clone()));
    let shared_sessions: Arc<dyn SharedSessionStore> = Arc::new(InMemorySessionStore::new());

    let instance_a = Instance::build(
        "a",
        network.clone(),
        mailbox.clone(),
        shared_sessions.clone(),
        events.clone(),
    )
    .await;
    let instance_b = Instance::build(
        "b",
        network,
        mailbox.clone(),
        shared_sessions,
        events,
    )
    .await;

    // The recipient's channel lives on b
    instance_b.directory.session_saved(session("c1")).await.unwrap();
    assert_eq!(
        instance_a.bus.connection_instance("c1").await.unwrap(),
        Some("b".to_string())
    );

    // a queues: no local session (a's directory is empty for c1), registry
    // names b, so a publishes a hand-off
    let envelope = instance_a.queue_and_route("c1", b"hello").await;
    assert_eq!(envelope.state, EnvelopeState::Pending);
    assert!(instance_a.transport.delivered().is_empty());
    assert_eq!(instance_a.gateway.sends.load(Ordering::Relaxed), 0);

    // b's listener consumes the hand-off and drains the mailbox
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let listener = tokio::spawn({
        let bus = instance_b.bus.clone();
        let handler: Arc<dyn HandoffHandler> = instance_b.orchestrator.clone();
        async move { bus.listen(handler, shutdown_rx).await }
    });

    for _ in 0..200 {
        if !instance_b.transport.delivered().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    shutdown_tx.send(true).unwrap();
    listener.await.unwrap().unwrap();

    let delivered = instance_b.transport.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].encrypted_message, b"hello");
    assert_eq!(mailbox.get_available_message_count("c1").await, 0);
}

#[tokio::test]
async fn test_stale_registry_record_is_dropped_and_fallback_fires() {
    let events = EventBus::default();
    let mailbox = Arc::new(InMemoryMailbox::new(events.clone()));
    let instance = Instance::build(
        "a",
        BusNetwork::new(),
        mailbox.clone(),
        Arc::new(InMemorySessionStore::new()),
        events,
    )
    .await;

    // Registry names this instance but no local session exists (crash left
    // the record behind)
    instance.bus.register_connection("c1").await.unwrap();

    instance.queue_and_route("c1", b"hello").await;

    assert_eq!(instance.gateway.sends.load(Ordering::Relaxed), 1);
    assert_eq!(instance.bus.connection_instance("c1").await.unwrap(), None);
    assert_eq!(mailbox.get_available_message_count("c1").await, 1);
}

#[tokio::test]
async fn test_event_loop_exits_when_shutdown_sender_dropped() {
    let events = EventBus::default();
    let mailbox = Arc::new(InMemoryMailbox::new(events.clone()));
    let instance = Instance::build(
        "a",
        BusNetwork::new(),
        mailbox,
        Arc::new(InMemorySessionStore::new()),
        events,
    )
    .await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let event_loop = tokio::spawn(instance.orchestrator.clone().run_event_loop(shutdown_rx));

    // A dropped sender must stop the loop, not leave it spinning
    drop(shutdown_tx);
    tokio::time::timeout(std::time::Duration::from_secs(1), event_loop)
        .await
        .expect("Event loop did not exit after sender drop")
        .unwrap();
}

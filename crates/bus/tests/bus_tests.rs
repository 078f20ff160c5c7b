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

//! Delivery bus contract tests, exercised against the in-memory backend.

use async_trait::async_trait;
use courier_bus::{
    BusError, BusNetwork, BusResult, DeliveryBus, HandoffHandler, HandoffMessage,
    InMemoryDeliveryBus,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

struct RecordingHandler {
    seen: Mutex<Vec<(HandoffMessage, String)>>,
    fail: AtomicBool,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    fn seen(&self) -> Vec<(HandoffMessage, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl HandoffHandler for RecordingHandler {
    async fn handle(&self, message: HandoffMessage, origin_instance: &str) -> BusResult<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(BusError::HandlerError("simulated failure".to_string()));
        }
        self.seen
            .lock()
            .unwrap()
            .push((message, origin_instance.to_string()));
        Ok(())
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("Condition not reached within timeout");
}

#[tokio::test]
async fn test_handoff_round_trip() {
    let network = BusNetwork::new();
    let bus_a = Arc::new(InMemoryDeliveryBus::new(network.clone(), "a".to_string()));
    let bus_b = Arc::new(InMemoryDeliveryBus::new(network, "b".to_string()));

    let handler = RecordingHandler::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = tokio::spawn({
        let bus_b = bus_b.clone();
        let handler = handler.clone();
        async move { bus_b.listen(handler, shutdown_rx).await }
    });

    bus_a
        .send_to_instance(
            "b",
            HandoffMessage {
                connection_id: "c1".to_string(),
            },
        )
        .await
        .unwrap();

    wait_until(|| handler.seen().len() == 1).await;
    let seen = handler.seen();
    assert_eq!(seen[0].0.connection_id, "c1");
    assert_eq!(seen[0].1, "b");

    // Handled entries are acknowledged, nothing stays pending
    assert_eq!(bus_b.pending_count("b").await.unwrap(), 0);

    shutdown_tx.send(true).unwrap();
    listener.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_handoff_is_recovered_by_peer() {
    let network = BusNetwork::new();
    let bus_a = Arc::new(InMemoryDeliveryBus::new(network.clone(), "a".to_string()));
    let bus_b = Arc::new(InMemoryDeliveryBus::new(network, "b".to_string()));

    // b's handler fails, simulating an instance that read the entry and died
    // before finishing delivery
    let failing_handler = RecordingHandler::new();
    failing_handler.fail.store(true, Ordering::Relaxed);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = tokio::spawn({
        let bus_b = bus_b.clone();
        let handler = failing_handler.clone();
        async move { bus_b.listen(handler, shutdown_rx).await }
    });

    bus_a
        .send_to_instance(
            "b",
            HandoffMessage {
                connection_id: "c1".to_string(),
            },
        )
        .await
        .unwrap();

    for _ in 0..200 {
        if bus_b.pending_count("b").await.unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(bus_b.pending_count("b").await.unwrap(), 1);
    shutdown_tx.send(true).unwrap();
    listener.await.unwrap().unwrap();

    // a sweeps b's abandoned entries and handles them itself
    let recovery_handler = RecordingHandler::new();
    let handled = bus_a.claim_abandoned(recovery_handler.clone()).await.unwrap();
    assert_eq!(handled, 1);

    let seen = recovery_handler.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0.connection_id, "c1");
    assert_eq!(seen[0].1, "b");
    assert_eq!(bus_a.pending_count("b").await.unwrap(), 0);
}

#[tokio::test]
async fn test_claim_skips_own_pending_entries() {
    let network = BusNetwork::new();
    let bus_a = Arc::new(InMemoryDeliveryBus::new(network.clone(), "a".to_string()));
    let bus_b = Arc::new(InMemoryDeliveryBus::new(network, "b".to_string()));

    let failing_handler = RecordingHandler::new();
    failing_handler.fail.store(true, Ordering::Relaxed);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = tokio::spawn({
        let bus_a = bus_a.clone();
        let handler = failing_handler.clone();
        async move { bus_a.listen(handler, shutdown_rx).await }
    });

    bus_b
        .send_to_instance(
            "a",
            HandoffMessage {
                connection_id: "c1".to_string(),
            },
        )
        .await
        .unwrap();

    for _ in 0..200 {
        if bus_a.pending_count("a").await.unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(bus_a.pending_count("a").await.unwrap(), 1);
    shutdown_tx.send(true).unwrap();
    listener.await.unwrap().unwrap();

    // An instance never reclaims its own pending entries in a sweep
    let recovery_handler = RecordingHandler::new();
    assert_eq!(bus_a.claim_abandoned(recovery_handler).await.unwrap(), 0);
    assert_eq!(bus_a.pending_count("a").await.unwrap(), 1);
}

#[tokio::test]
async fn test_listener_exits_when_shutdown_sender_dropped() {
    let network = BusNetwork::new();
    let bus = Arc::new(InMemoryDeliveryBus::new(network, "a".to_string()));
    let handler = RecordingHandler::new();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = tokio::spawn({
        let bus = bus.clone();
        let handler = handler.clone();
        async move { bus.listen(handler, shutdown_rx).await }
    });

    // A dropped sender must stop the loop, not leave it spinning
    drop(shutdown_tx);
    tokio::time::timeout(Duration::from_secs(1), listener)
        .await
        .expect("Listener did not exit after sender drop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_claim_loop_exits_when_shutdown_sender_dropped() {
    let network = BusNetwork::new();
    let bus = Arc::new(InMemoryDeliveryBus::new(network, "a".to_string()));
    let handler = RecordingHandler::new();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn({
        let bus = bus.clone();
        async move {
            bus.run_claim_loop(handler, Duration::from_millis(10), shutdown_rx)
                .await
        }
    });

    drop(shutdown_tx);
    tokio::time::timeout(Duration::from_secs(1), sweeper)
        .await
        .expect("Claim loop did not exit after sender drop")
        .unwrap();
}

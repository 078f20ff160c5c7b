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

//! In-memory delivery bus backend.
//!
//! ## Purpose
//! Deterministic single-process stand-in for the Redis bus: several logical
//! instances share one [`BusNetwork`], which models the registry, the
//! per-instance inbox queues, and the delivered-but-unacknowledged pending
//! lists.
//!
//! Differences from the Redis backend, acceptable for its test/single-node
//! role: ownership records never expire, and `claim_abandoned` takes every
//! pending entry of other instances without an idle threshold (tests control
//! timing explicitly).

use crate::{BusError, BusResult, DeliveryBus, HandoffHandler, HandoffMessage};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    message: HandoffMessage,
}

#[derive(Debug, Default)]
struct NetworkState {
    /// connection id → owning instance id
    registry: HashMap<String, String>,
    /// instance id → undelivered entries
    queues: HashMap<String, VecDeque<Entry>>,
    /// instance id → delivered-but-unacknowledged entries
    pending: HashMap<String, Vec<Entry>>,
}

/// Shared state connecting every [`InMemoryDeliveryBus`] built on it.
#[derive(Debug, Default)]
pub struct BusNetwork {
    state: Mutex<NetworkState>,
    next_entry_id: AtomicU64,
}

impl BusNetwork {
    /// Create an isolated network (multi-instance tests build several buses
    /// on one of these).
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_id(&self) -> String {
        format!("mem-{}", self.next_entry_id.fetch_add(1, Ordering::Relaxed))
    }
}

fn shared_network() -> Arc<BusNetwork> {
    static NETWORK: OnceLock<Arc<BusNetwork>> = OnceLock::new();
    NETWORK.get_or_init(BusNetwork::new).clone()
}

/// In-memory delivery bus bound to one logical instance on a network.
pub struct InMemoryDeliveryBus {
    network: Arc<BusNetwork>,
    instance_id: String,
}

impl InMemoryDeliveryBus {
    /// Create a bus for `instance_id` on an explicit network.
    pub fn new(network: Arc<BusNetwork>, instance_id: String) -> Self {
        Self {
            network,
            instance_id,
        }
    }

    /// Create a bus on the process-wide shared network.
    pub fn new_on_shared_network(instance_id: String) -> Self {
        Self::new(shared_network(), instance_id)
    }

    /// Run one entry through the handler; acknowledged entries leave the
    /// pending list, failed ones stay for a later sweep.
    async fn process_pending_entry(
        &self,
        handler: &Arc<dyn HandoffHandler>,
        origin_instance: &str,
        entry: Entry,
    ) -> bool {
        match handler.handle(entry.message.clone(), origin_instance).await {
            Ok(()) => {
                let mut state = self
                    .network
                    .state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Some(pending) = state.pending.get_mut(origin_instance) {
                    pending.retain(|e| e.id != entry.id);
                }
                true
            }
            Err(err) => {
                warn!(
                    connection_id = %entry.message.connection_id,
                    entry_id = %entry.id,
                    "Hand-off handler failed, leaving entry pending: {}", err
                );
                false
            }
        }
    }
}

#[async_trait]
impl DeliveryBus for InMemoryDeliveryBus {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn register_connection(&self, connection_id: &str) -> BusResult<()> {
        let mut state = self
            .network
            .state
            .lock()
            .map_err(|e| BusError::BackendError(format!("Lock poisoned: {}", e)))?;
        state
            .registry
            .insert(connection_id.to_string(), self.instance_id.clone());
        Ok(())
    }

    async fn unregister_connection(&self, connection_id: &str) -> BusResult<()> {
        let mut state = self
            .network
            .state
            .lock()
            .map_err(|e| BusError::BackendError(format!("Lock poisoned: {}", e)))?;
        state.registry.remove(connection_id);
        Ok(())
    }

    async fn connection_instance(&self, connection_id: &str) -> BusResult<Option<String>> {
        let state = self
            .network
            .state
            .lock()
            .map_err(|e| BusError::BackendError(format!("Lock poisoned: {}", e)))?;
        Ok(state.registry.get(connection_id).cloned())
    }

    async fn send_to_instance(
        &self,
        instance_id: &str,
        message: HandoffMessage,
    ) -> BusResult<String> {
        let entry = Entry {
            id: self.network.next_id(),
            message,
        };
        let entry_id = entry.id.clone();

        let mut state = self
            .network
            .state
            .lock()
            .map_err(|e| BusError::BackendError(format!("Lock poisoned: {}", e)))?;
        state
            .queues
            .entry(instance_id.to_string())
            .or_default()
            .push_back(entry);

        debug!(target_instance = %instance_id, entry_id = %entry_id, "Published hand-off");
        Ok(entry_id)
    }

    async fn pending_count(&self, instance_id: &str) -> BusResult<u64> {
        let state = self
            .network
            .state
            .lock()
            .map_err(|e| BusError::BackendError(format!("Lock poisoned: {}", e)))?;
        Ok(state
            .pending
            .get(instance_id)
            .map(|pending| pending.len() as u64)
            .unwrap_or(0))
    }

    async fn listen(
        &self,
        handler: Arc<dyn HandoffHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> BusResult<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let entry = {
                let mut state = self
                    .network
                    .state
                    .lock()
                    .map_err(|e| BusError::BackendError(format!("Lock poisoned: {}", e)))?;
                let entry = state
                    .queues
                    .get_mut(&self.instance_id)
                    .and_then(|queue| queue.pop_front());
                if let Some(entry) = &entry {
                    state
                        .pending
                        .entry(self.instance_id.clone())
                        .or_default()
                        .push(entry.clone());
                }
                entry
            };

            match entry {
                Some(entry) => {
                    self.process_pending_entry(&handler, &self.instance_id.clone(), entry)
                        .await;
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                        changed = shutdown.changed() => {
                            // A dropped sender means the owner is gone
                            if changed.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    async fn claim_abandoned(&self, handler: Arc<dyn HandoffHandler>) -> BusResult<u64> {
        let abandoned: Vec<(String, Vec<Entry>)> = {
            let state = self
                .network
                .state
                .lock()
                .map_err(|e| BusError::BackendError(format!("Lock poisoned: {}", e)))?;
            state
                .pending
                .iter()
                .filter(|(instance, pending)| *instance != &self.instance_id && !pending.is_empty())
                .map(|(instance, pending)| (instance.clone(), pending.clone()))
                .collect()
        };

        let mut handled = 0u64;
        for (origin_instance, entries) in abandoned {
            for entry in entries {
                if self
                    .process_pending_entry(&handler, &origin_instance, entry)
                    .await
                {
                    handled += 1;
                }
            }
        }
        Ok(handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_round_trip() {
        let network = BusNetwork::new();
        let bus_a = InMemoryDeliveryBus::new(network.clone(), "a".to_string());
        let bus_b = InMemoryDeliveryBus::new(network, "b".to_string());

        bus_a.register_connection("c1").await.unwrap();
        // Registration is visible across instances
        assert_eq!(
            bus_b.connection_instance("c1").await.unwrap(),
            Some("a".to_string())
        );

        // Last writer wins
        bus_b.register_connection("c1").await.unwrap();
        assert_eq!(
            bus_a.connection_instance("c1").await.unwrap(),
            Some("b".to_string())
        );

        bus_a.unregister_connection("c1").await.unwrap();
        assert_eq!(bus_a.connection_instance("c1").await.unwrap(), None);
    }
}

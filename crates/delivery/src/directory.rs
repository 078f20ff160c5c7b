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

//! Live session directory.
//!
//! ## Purpose
//! Tracks which connections currently hold an open delivery channel. The
//! local map is authoritative for sessions owned by this process; every
//! change is mirrored to the shared directory and the bus registry so other
//! instances can route hand-offs here.
//!
//! ## Teardown ordering
//! `session_removed` reconciles in-flight envelopes (`requeue_in_flight`)
//! BEFORE deleting the shared row. The reverse order would open a window
//! where a peer sees no session yet the envelopes are still claimed by a
//! channel that no longer exists.

use crate::DeliveryResult;
use async_trait::async_trait;
use courier_bus::DeliveryBus;
use courier_core::{
    EventBus, GatewayEvent, LiveSession, LocalSessionLookup, SessionStoreError, SharedSessionStore,
};
use courier_mailbox::MailboxStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Directory of live sessions, local map plus fleet-visible mirrors.
pub struct LiveSessionDirectory {
    local: RwLock<HashMap<String, LiveSession>>,
    shared: Arc<dyn SharedSessionStore>,
    mailbox: Arc<dyn MailboxStore>,
    bus: Arc<dyn DeliveryBus>,
    events: EventBus,
}

impl LiveSessionDirectory {
    /// Create a directory over the given collaborators.
    pub fn new(
        shared: Arc<dyn SharedSessionStore>,
        mailbox: Arc<dyn MailboxStore>,
        bus: Arc<dyn DeliveryBus>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            local: RwLock::new(HashMap::new()),
            shared,
            mailbox,
            bus,
            events,
        })
    }

    /// A delivery channel opened on this instance.
    ///
    /// Records it locally, mirrors it to the shared directory (upsert, last
    /// write wins) and refreshes the bus ownership record.
    pub async fn session_saved(&self, mut session: LiveSession) -> DeliveryResult<()> {
        session.instance_id = self.bus.instance_id().to_string();
        session.is_local = true;

        {
            let mut local = self.local.write().await;
            local.insert(session.connection_id.clone(), session.clone());
        }
        self.shared.save(&session).await?;
        self.bus.register_connection(&session.connection_id).await?;

        info!(
            connection_id = %session.connection_id,
            session_id = %session.id,
            "Live session opened"
        );
        metrics::gauge!("courier_live_sessions").increment(1.0);
        self.events.publish(GatewayEvent::SessionSaved(session));
        Ok(())
    }

    /// A delivery channel closed (or its holder is shutting down).
    ///
    /// In-flight envelopes are requeued before the shared row disappears;
    /// see the module docs for why the order matters.
    pub async fn session_removed(&self, connection_id: &str) -> DeliveryResult<()> {
        let had_session = {
            let mut local = self.local.write().await;
            local.remove(connection_id).is_some()
        };

        let requeued = self.mailbox.requeue_in_flight(connection_id).await?;
        if requeued > 0 {
            debug!(
                connection_id = %connection_id,
                requeued,
                "Requeued envelopes stranded by closing session"
            );
        }

        self.shared.remove(connection_id).await?;
        if let Err(err) = self.bus.unregister_connection(connection_id).await {
            // The registry record expires on its own TTL
            warn!(connection_id = %connection_id, "Failed to unregister connection: {}", err);
        }

        if had_session {
            info!(connection_id = %connection_id, "Live session closed");
            metrics::gauge!("courier_live_sessions").decrement(1.0);
        }
        self.events.publish(GatewayEvent::SessionRemoved {
            connection_id: connection_id.to_string(),
        });
        Ok(())
    }

    /// Session held by this process, if any.
    pub async fn find_local_live_session(&self, connection_id: &str) -> Option<LiveSession> {
        let local = self.local.read().await;
        local.get(connection_id).cloned()
    }

    /// Session visible in the shared directory (any instance), tagged
    /// non-local unless it is ours.
    pub async fn find_shared_live_session(
        &self,
        connection_id: &str,
    ) -> DeliveryResult<Option<LiveSession>> {
        if let Some(session) = self.find_local_live_session(connection_id).await {
            return Ok(Some(session));
        }
        Ok(self.shared.find(connection_id).await?)
    }
}

#[async_trait]
impl LocalSessionLookup for LiveSessionDirectory {
    async fn find_local_session(&self, connection_id: &str) -> Option<LiveSession> {
        self.find_local_live_session(connection_id).await
    }
}

/// Shared session store for tests and single-instance deployments.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, LiveSession>>,
}

impl InMemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedSessionStore for InMemorySessionStore {
    async fn save(&self, session: &LiveSession) -> Result<(), SessionStoreError> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.connection_id.clone(), session.clone());
        Ok(())
    }

    async fn find(&self, connection_id: &str) -> Result<Option<LiveSession>, SessionStoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(connection_id).map(|session| LiveSession {
            is_local: false,
            ..session.clone()
        }))
    }

    async fn remove(&self, connection_id: &str) -> Result<(), SessionStoreError> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(connection_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_bus::{BusNetwork, InMemoryDeliveryBus};
    use courier_core::SessionRole;
    use courier_mailbox::InMemoryMailbox;

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

    fn directory() -> Arc<LiveSessionDirectory> {
        let network = BusNetwork::new();
        LiveSessionDirectory::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryMailbox::default()),
            Arc::new(InMemoryDeliveryBus::new(network, "a".to_string())),
            EventBus::default(),
        )
    }

    #[tokio::test]
    async fn test_saved_session_is_local_and_shared() {
        let directory = directory();
        directory.session_saved(session("c1")).await.unwrap();

        let local = directory.find_local_live_session("c1").await.unwrap();
        assert!(local.is_local);
        assert_eq!(local.instance_id, "a");

        let shared = directory.find_shared_live_session("c1").await.unwrap().unwrap();
        assert_eq!(shared.connection_id, "c1");
    }

    #[tokio::test]
    async fn test_removed_session_disappears_everywhere() {
        let directory = directory();
        directory.session_saved(session("c1")).await.unwrap();
        directory.session_removed("c1").await.unwrap();

        assert!(directory.find_local_live_session("c1").await.is_none());
        assert!(directory.find_shared_live_session("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_unknown_session_is_noop() {
        let directory = directory();
        directory.session_removed("missing").await.unwrap();
    }
}

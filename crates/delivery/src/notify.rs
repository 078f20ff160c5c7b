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

//! Notification fallback.
//!
//! ## Purpose
//! Last rung of the delivery ladder: when a message cannot be delivered over
//! any live channel, wake the recipient out-of-band. Two independent
//! mechanisms, each best-effort:
//!
//! - **Provider push**: a device token may be registered under any one of
//!   several provider projects, and nothing records which one at
//!   registration time. The fallback iterates the configured project ids,
//!   last-known-good first, and persists the project that worked back to the
//!   notification record so later sends hit it on the first try.
//! - **Webhook**: a single POST to the configured endpoint, fire-and-forget.
//!
//! Notification failures never propagate: the envelope stays safely queued
//! and a later session pickup or recovery sweep delivers it.

use crate::{DeliveryConfig, NotifyError};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Push provider seam; implementations wrap the vendor SDK or HTTP API.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Send one push through the given provider project.
    async fn send(
        &self,
        project_id: &str,
        device_token: &str,
        title: &str,
        body: &str,
    ) -> Result<(), NotifyError>;
}

/// Per-connection notification settings, owned by the wallet subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    /// Connection the record belongs to.
    pub connection_id: String,
    /// Registered device token, if the client registered for push.
    pub device_token: Option<String>,
    /// Provider project that last accepted this token.
    pub push_project_id: Option<String>,
}

/// Lookup/update seam for notification records.
#[async_trait]
pub trait NotificationRecordStore: Send + Sync {
    /// Fetch the record for a connection, if one exists.
    async fn find_by_connection(&self, connection_id: &str) -> Option<NotificationRecord>;

    /// Persist an updated record (best-effort; failures are the store's to
    /// log).
    async fn update(&self, record: NotificationRecord);
}

/// Record store for tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryNotificationStore {
    records: RwLock<HashMap<String, NotificationRecord>>,
}

impl InMemoryNotificationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub async fn insert(&self, record: NotificationRecord) {
        let mut records = self.records.write().await;
        records.insert(record.connection_id.clone(), record);
    }
}

#[async_trait]
impl NotificationRecordStore for InMemoryNotificationStore {
    async fn find_by_connection(&self, connection_id: &str) -> Option<NotificationRecord> {
        let records = self.records.read().await;
        records.get(connection_id).cloned()
    }

    async fn update(&self, record: NotificationRecord) {
        self.insert(record).await;
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    connection_id: &'a str,
    device_token: Option<&'a str>,
}

/// Out-of-band wake-up sender.
pub struct NotificationFallback {
    gateway: Option<Arc<dyn PushGateway>>,
    store: Arc<dyn NotificationRecordStore>,
    http: reqwest::Client,
    config: DeliveryConfig,
}

impl NotificationFallback {
    /// Create the fallback. `gateway = None` disables provider push (webhook
    /// still runs if configured).
    pub fn new(
        gateway: Option<Arc<dyn PushGateway>>,
        store: Arc<dyn NotificationRecordStore>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Notify the recipient of a connection that messages are waiting.
    ///
    /// Never returns an error: both mechanisms are best-effort by contract.
    pub async fn notify(&self, connection_id: &str) {
        let record = self.store.find_by_connection(connection_id).await;
        let device_token = record.as_ref().and_then(|r| r.device_token.clone());

        match &device_token {
            Some(token) => self.send_push(connection_id, token, record.as_ref()).await,
            None => {
                debug!(connection_id = %connection_id, "No device token registered, skipping push");
            }
        }

        if self.config.webhook_url.is_some() {
            self.send_webhook(connection_id, device_token.as_deref()).await;
        }
    }

    /// Try each configured project until one accepts the token, then pin it.
    async fn send_push(
        &self,
        connection_id: &str,
        device_token: &str,
        record: Option<&NotificationRecord>,
    ) {
        let Some(gateway) = &self.gateway else {
            return;
        };
        if self.config.push_project_ids.is_empty() {
            return;
        }

        let pinned = record.and_then(|r| r.push_project_id.clone());
        let mut project_ids: Vec<&str> = Vec::with_capacity(self.config.push_project_ids.len());
        if let Some(pinned) = &pinned {
            if self.config.push_project_ids.iter().any(|id| id == pinned) {
                project_ids.push(pinned);
            }
        }
        for id in &self.config.push_project_ids {
            if Some(id) != pinned.as_ref() {
                project_ids.push(id);
            }
        }

        for project_id in project_ids {
            match gateway
                .send(
                    project_id,
                    device_token,
                    &self.config.notification_title,
                    &self.config.notification_body,
                )
                .await
            {
                Ok(()) => {
                    info!(
                        connection_id = %connection_id,
                        project_id = %project_id,
                        "Push notification sent"
                    );
                    metrics::counter!("courier_push_notifications_total").increment(1);
                    if pinned.as_deref() != Some(project_id) {
                        if let Some(record) = record {
                            let mut updated = record.clone();
                            updated.push_project_id = Some(project_id.to_string());
                            self.store.update(updated).await;
                        }
                    }
                    return;
                }
                Err(NotifyError::Provider(reason)) => {
                    // Expected when the token belongs to another project
                    debug!(
                        connection_id = %connection_id,
                        project_id = %project_id,
                        "Provider declined push: {}", reason
                    );
                }
                Err(err) => {
                    error!(
                        connection_id = %connection_id,
                        project_id = %project_id,
                        "Push send failed: {}", err
                    );
                }
            }
        }

        warn!(
            connection_id = %connection_id,
            "No configured project accepted the push notification"
        );
    }

    async fn send_webhook(&self, connection_id: &str, device_token: Option<&str>) {
        let Some(url) = &self.config.webhook_url else {
            return;
        };

        let payload = WebhookPayload {
            connection_id,
            device_token,
        };
        match self.http.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(connection_id = %connection_id, "Webhook notified");
                metrics::counter!("courier_webhook_notifications_total").increment(1);
            }
            Ok(response) => {
                warn!(
                    connection_id = %connection_id,
                    status = %response.status(),
                    "Webhook returned non-success status"
                );
            }
            Err(err) => {
                warn!(connection_id = %connection_id, "Webhook request failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Gateway that accepts sends only for one project id.
    struct SingleProjectGateway {
        accepts: String,
        sends: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PushGateway for SingleProjectGateway {
        async fn send(
            &self,
            project_id: &str,
            _device_token: &str,
            _title: &str,
            _body: &str,
        ) -> Result<(), NotifyError> {
            self.sends.lock().unwrap().push(project_id.to_string());
            if project_id == self.accepts {
                Ok(())
            } else {
                Err(NotifyError::Provider("token not in project".to_string()))
            }
        }
    }

    fn config(project_ids: &[&str]) -> DeliveryConfig {
        DeliveryConfig {
            push_project_ids: project_ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_push_pins_working_project() {
        let gateway = Arc::new(SingleProjectGateway {
            accepts: "project-b".to_string(),
            sends: Mutex::new(Vec::new()),
        });
        let store = Arc::new(InMemoryNotificationStore::new());
        store
            .insert(NotificationRecord {
                connection_id: "c1".to_string(),
                device_token: Some("token".to_string()),
                push_project_id: None,
            })
            .await;

        let fallback = NotificationFallback::new(
            Some(gateway.clone()),
            store.clone(),
            config(&["project-a", "project-b"]),
        );
        fallback.notify("c1").await;

        // Tried a, failed, then b succeeded and got pinned
        assert_eq!(*gateway.sends.lock().unwrap(), vec!["project-a", "project-b"]);
        let record = store.find_by_connection("c1").await.unwrap();
        assert_eq!(record.push_project_id.as_deref(), Some("project-b"));

        // Next notify hits the pinned project first
        gateway.sends.lock().unwrap().clear();
        fallback.notify("c1").await;
        assert_eq!(*gateway.sends.lock().unwrap(), vec!["project-b"]);
    }

    #[tokio::test]
    async fn test_no_device_token_skips_push() {
        let gateway = Arc::new(SingleProjectGateway {
            accepts: "project-a".to_string(),
            sends: Mutex::new(Vec::new()),
        });
        let store = Arc::new(InMemoryNotificationStore::new());
        store
            .insert(NotificationRecord {
                connection_id: "c1".to_string(),
                device_token: None,
                push_project_id: None,
            })
            .await;

        let fallback =
            NotificationFallback::new(Some(gateway.clone()), store, config(&["project-a"]));
        fallback.notify("c1").await;

        assert!(gateway.sends.lock().unwrap().is_empty());
    }

    #[test]
    fn test_webhook_payload_shape() {
        let payload = WebhookPayload {
            connection_id: "c1",
            device_token: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"connectionId":"c1","deviceToken":null}"#);
    }
}

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

//! Redis Streams delivery bus backend.
//!
//! ## Wire layout
//! - Registry: `connection:{connection_id}` → instance id, `SETEX` with the
//!   configured TTL
//! - Inbox stream per instance: `server:{instance_id}:outbox`, consumer
//!   group `default`, consumer `{instance_id}-consumer`
//! - Entry: single `message` field holding the JSON hand-off payload
//!
//! ## Protocol
//! - **XADD for send**: append the hand-off to the target's stream
//! - **XREADGROUP for listen**: blocking batched reads of the own stream
//! - **XACK after handling**: an entry is acknowledged only once the handler
//!   succeeds, so a crash between read and ack redelivers it
//! - **XAUTOCLAIM for recovery**: sweep other instances' streams for entries
//!   idle past the threshold and process them locally
//!
//! Undecodable entries are acknowledged and skipped; leaving them pending
//! would make every recovery sweep rechew the same poison entry.

use crate::{BusConfig, BusError, BusResult, DeliveryBus, HandoffHandler, HandoffMessage};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisResult, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const CONSUMER_GROUP: &str = "default";

/// Redis-backed delivery bus.
#[derive(Clone)]
pub struct RedisDeliveryBus {
    conn: ConnectionManager,
    config: BusConfig,
    consumer_name: String,
}

impl RedisDeliveryBus {
    /// Connect and create the local inbox stream's consumer group.
    pub async fn new(url: &str, config: BusConfig) -> BusResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| BusError::BackendError(format!("Failed to create Redis client: {}", e)))?;
        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BusError::BackendError(format!("Failed to connect to Redis: {}", e)))?;

        let consumer_name = format!("{}-consumer", config.instance_id);
        let bus = Self {
            conn: conn.clone(),
            config,
            consumer_name,
        };
        Self::ensure_group(&mut conn, &bus.own_stream()).await;

        debug!(instance_id = %bus.config.instance_id, "Redis delivery bus initialized");
        Ok(bus)
    }

    fn registry_key(connection_id: &str) -> String {
        format!("connection:{}", connection_id)
    }

    fn stream_key(instance_id: &str) -> String {
        format!("server:{}:outbox", instance_id)
    }

    fn own_stream(&self) -> String {
        Self::stream_key(&self.config.instance_id)
    }

    /// Extract the instance id out of a `server:{id}:outbox` key.
    fn instance_of_stream(stream_key: &str) -> Option<&str> {
        stream_key
            .strip_prefix("server:")
            .and_then(|rest| rest.strip_suffix(":outbox"))
    }

    /// Create the consumer group, ignoring the BUSYGROUP error when it
    /// already exists.
    async fn ensure_group(conn: &mut ConnectionManager, stream_key: &str) {
        let result: RedisResult<Value> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key)
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;
        if let Err(err) = result {
            if !err.to_string().contains("BUSYGROUP") {
                warn!(stream = %stream_key, "Failed to create consumer group: {}", err);
            }
        }
    }

    /// Walk an XREADGROUP reply down to `(entry_id, message_field)` pairs.
    fn parse_xread_response(value: &Value) -> Vec<(String, Option<String>)> {
        let mut entries = Vec::new();
        if let Value::Array(streams) = value {
            for stream in streams {
                if let Value::Array(stream_parts) = stream {
                    if stream_parts.len() >= 2 {
                        entries.extend(Self::parse_entries(&stream_parts[1]));
                    }
                }
            }
        }
        entries
    }

    /// Parse a flat entry list (`[[id, [field, value, …]], …]`).
    fn parse_entries(value: &Value) -> Vec<(String, Option<String>)> {
        let mut entries = Vec::new();
        let Value::Array(items) = value else {
            return entries;
        };
        for item in items {
            let Value::Array(entry_parts) = item else {
                continue;
            };
            if entry_parts.is_empty() {
                continue;
            }
            let Some(entry_id) = Self::as_string(&entry_parts[0]) else {
                continue;
            };

            let mut message = None;
            if entry_parts.len() >= 2 {
                if let Value::Array(fields) = &entry_parts[1] {
                    let mut i = 0;
                    while i + 1 < fields.len() {
                        if Self::as_string(&fields[i]).as_deref() == Some("message") {
                            message = Self::as_string(&fields[i + 1]);
                        }
                        i += 2;
                    }
                }
            }
            entries.push((entry_id, message));
        }
        entries
    }

    fn as_string(value: &Value) -> Option<String> {
        match value {
            Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            Value::SimpleString(s) => Some(s.clone()),
            _ => None,
        }
    }

    async fn ack(&self, stream_key: &str, entry_id: &str) -> BusResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(stream_key)
            .arg(CONSUMER_GROUP)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Run one decoded-or-not entry through the handler, acknowledging per
    /// the at-least-once rules. Returns true when the entry was handled.
    async fn process_entry(
        &self,
        handler: &Arc<dyn HandoffHandler>,
        stream_key: &str,
        origin_instance: &str,
        entry_id: &str,
        message_field: Option<String>,
    ) -> bool {
        let message = message_field
            .ok_or_else(|| BusError::InvalidMessage("Missing message field".to_string()))
            .and_then(|raw| serde_json::from_str::<HandoffMessage>(&raw).map_err(BusError::from));

        let message = match message {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    stream = %stream_key,
                    entry_id = %entry_id,
                    "Acknowledging undecodable hand-off entry: {}", err
                );
                if let Err(ack_err) = self.ack(stream_key, entry_id).await {
                    error!(entry_id = %entry_id, "Failed to ack poison entry: {}", ack_err);
                }
                return false;
            }
        };

        match handler.handle(message.clone(), origin_instance).await {
            Ok(()) => {
                if let Err(err) = self.ack(stream_key, entry_id).await {
                    // Redelivery is harmless, the handler is idempotent
                    // over mailbox state
                    error!(entry_id = %entry_id, "Failed to ack handled entry: {}", err);
                }
                metrics::counter!("courier_bus_handoffs_handled_total").increment(1);
                true
            }
            Err(err) => {
                warn!(
                    connection_id = %message.connection_id,
                    entry_id = %entry_id,
                    "Hand-off handler failed, leaving entry pending: {}", err
                );
                false
            }
        }
    }

    /// Summary XPENDING count for one stream.
    async fn stream_pending_count(&self, stream_key: &str) -> BusResult<u64> {
        let mut conn = self.conn.clone();
        let result: Value = redis::cmd("XPENDING")
            .arg(stream_key)
            .arg(CONSUMER_GROUP)
            .query_async(&mut conn)
            .await?;
        match result {
            Value::Array(parts) => match parts.first() {
                Some(Value::Int(count)) => Ok(*count as u64),
                _ => Ok(0),
            },
            _ => Ok(0),
        }
    }
}

#[async_trait]
impl DeliveryBus for RedisDeliveryBus {
    fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    async fn register_connection(&self, connection_id: &str) -> BusResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SETEX")
            .arg(Self::registry_key(connection_id))
            .arg(self.config.registry_ttl.as_secs())
            .arg(&self.config.instance_id)
            .query_async(&mut conn)
            .await?;
        debug!(connection_id = %connection_id, "Registered connection ownership");
        Ok(())
    }

    async fn unregister_connection(&self, connection_id: &str) -> BusResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(Self::registry_key(connection_id))
            .query_async(&mut conn)
            .await?;
        debug!(connection_id = %connection_id, "Unregistered connection ownership");
        Ok(())
    }

    async fn connection_instance(&self, connection_id: &str) -> BusResult<Option<String>> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = redis::cmd("GET")
            .arg(Self::registry_key(connection_id))
            .query_async(&mut conn)
            .await?;
        Ok(owner)
    }

    async fn send_to_instance(
        &self,
        instance_id: &str,
        message: HandoffMessage,
    ) -> BusResult<String> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&message)?;

        let entry_id: String = redis::cmd("XADD")
            .arg(Self::stream_key(instance_id))
            .arg("*")
            .arg("message")
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        metrics::counter!("courier_bus_handoffs_sent_total").increment(1);
        debug!(
            connection_id = %message.connection_id,
            target_instance = %instance_id,
            entry_id = %entry_id,
            "Published hand-off"
        );
        Ok(entry_id)
    }

    async fn pending_count(&self, instance_id: &str) -> BusResult<u64> {
        self.stream_pending_count(&Self::stream_key(instance_id)).await
    }

    async fn listen(
        &self,
        handler: Arc<dyn HandoffHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> BusResult<()> {
        let stream_key = self.own_stream();
        let mut conn = self.conn.clone();
        Self::ensure_group(&mut conn, &stream_key).await;

        info!(stream = %stream_key, "Listening for hand-offs");
        loop {
            if *shutdown.borrow() {
                info!(stream = %stream_key, "Hand-off listener shutting down");
                return Ok(());
            }

            // XREADGROUP GROUP default consumer COUNT n BLOCK ms STREAMS stream >
            let mut cmd = redis::cmd("XREADGROUP");
            cmd.arg("GROUP")
                .arg(CONSUMER_GROUP)
                .arg(&self.consumer_name)
                .arg("COUNT")
                .arg(self.config.batch_size)
                .arg("BLOCK")
                .arg(self.config.block_ms)
                .arg("STREAMS")
                .arg(&stream_key)
                .arg(">");
            let read = cmd.query_async::<Value>(&mut conn);

            let result = tokio::select! {
                result = read => result,
                changed = shutdown.changed() => {
                    // A dropped sender means the owner is gone; shut down
                    if changed.is_err() {
                        info!(stream = %stream_key, "Hand-off listener shutting down");
                        return Ok(());
                    }
                    continue;
                }
            };

            let value = match result {
                Ok(value) => value,
                Err(err) => {
                    error!(stream = %stream_key, "Blocking read failed: {}", err);
                    tokio::time::sleep(std::time::Duration::from_millis(self.config.block_ms))
                        .await;
                    continue;
                }
            };

            for (entry_id, message_field) in Self::parse_xread_response(&value) {
                self.process_entry(
                    &handler,
                    &stream_key,
                    &self.config.instance_id,
                    &entry_id,
                    message_field,
                )
                .await;
            }
        }
    }

    async fn claim_abandoned(&self, handler: Arc<dyn HandoffHandler>) -> BusResult<u64> {
        let mut conn = self.conn.clone();
        let own_stream = self.own_stream();

        // Streams are few (one per instance), KEYS is acceptable here
        let stream_keys: Vec<String> = redis::cmd("KEYS")
            .arg("server:*:outbox")
            .query_async(&mut conn)
            .await?;

        let mut handled = 0u64;
        for stream_key in stream_keys {
            if stream_key == own_stream {
                continue;
            }
            let Some(origin_instance) = Self::instance_of_stream(&stream_key) else {
                continue;
            };

            let pending = match self.stream_pending_count(&stream_key).await {
                Ok(pending) => pending,
                Err(err) => {
                    // The group may not exist yet on a stream we have never
                    // touched
                    debug!(stream = %stream_key, "Skipping stream without pending info: {}", err);
                    continue;
                }
            };
            if pending == 0 {
                continue;
            }

            // XAUTOCLAIM stream group consumer min-idle-time 0-0 COUNT n
            let result: Value = redis::cmd("XAUTOCLAIM")
                .arg(&stream_key)
                .arg(CONSUMER_GROUP)
                .arg(&self.consumer_name)
                .arg(self.config.min_idle.as_millis() as u64)
                .arg("0-0")
                .arg("COUNT")
                .arg(self.config.batch_size)
                .query_async(&mut conn)
                .await?;

            let entries = match &result {
                Value::Array(parts) if parts.len() >= 2 => Self::parse_entries(&parts[1]),
                _ => Vec::new(),
            };
            if entries.is_empty() {
                continue;
            }

            info!(
                stream = %stream_key,
                count = entries.len(),
                "Claimed abandoned hand-offs"
            );
            for (entry_id, message_field) in entries {
                if self
                    .process_entry(&handler, &stream_key, origin_instance, &entry_id, message_field)
                    .await
                {
                    handled += 1;
                }
            }
        }

        if handled > 0 {
            metrics::counter!("courier_bus_handoffs_recovered_total").increment(handled);
        }
        Ok(handled)
    }
}

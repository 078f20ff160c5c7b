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

//! DynamoDB mailbox backend.
//!
//! ## Purpose
//! Partitioned key-value implementation of [`MailboxStore`] for deployments
//! without a relational database.
//!
//! ## Schema
//! - Partition key: `connection_id` (String)
//! - Sort key: `id` (String) — composite `{received_at_millis:013}-{ulid}`,
//!   so a key-ordered query returns envelopes in arrival order
//! - Attributes: `recipient_dids` (List of String, may be empty),
//!   `encrypted_message` (Binary), `state` (String), `received_at` (Number,
//!   epoch millis)
//!
//! `state` is a DynamoDB reserved word; every expression aliases it as `#s`.
//!
//! ## Claim atomicity
//! There is no multi-item atomic update, so `take_from_queue` claims each
//! candidate with a conditional `UpdateItem` (`#s = :pending`). A concurrent
//! claimer loses the condition check and skips the item, which preserves the
//! exclusive-claim guarantee at per-item granularity.
//!
//! ## Limitations
//! A recipient identifier cannot widen the match beyond the partition the
//! way the relational OR-query can: `recipient_did` is applied as a
//! `contains(recipient_dids, :did)` filter within the connection's
//! partition. Deployments that rely on cross-partition identifier pickup
//! use the Postgres backend.

use crate::{
    AddMessageOptions, MailboxError, MailboxResult, MailboxStore, TakeFromQueueOptions,
};
use async_trait::async_trait;
use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType, Select, TableStatus,
};
use aws_sdk_dynamodb::Client as DynamoDbClient;
use chrono::{DateTime, TimeZone, Utc};
use courier_core::{EnvelopeState, EventBus, GatewayEvent, LocalSessionLookup, QueuedEnvelope};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error, warn};
use ulid::Ulid;

/// DynamoDB-backed mailbox store.
#[derive(Clone)]
pub struct DynamoDbMailbox {
    client: DynamoDbClient,
    table_name: String,
    events: EventBus,
    session_lookup: Arc<OnceLock<Arc<dyn LocalSessionLookup>>>,
}

impl DynamoDbMailbox {
    /// Connect and create the table if it does not exist yet.
    ///
    /// Region and credentials come from the ambient AWS environment;
    /// `endpoint_url` overrides the endpoint for DynamoDB Local testing.
    pub async fn new(
        table_name: &str,
        endpoint_url: Option<&str>,
        events: EventBus,
    ) -> MailboxResult<Self> {
        let mut config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = endpoint_url {
            config_builder = config_builder.endpoint_url(endpoint);
        }
        let config = config_builder.load().await;
        let client = DynamoDbClient::new(&config);

        Self::ensure_table_exists(&client, table_name).await?;

        debug!(table_name = %table_name, "DynamoDB mailbox initialized");
        Ok(Self {
            client,
            table_name: table_name.to_string(),
            events,
            session_lookup: Arc::new(OnceLock::new()),
        })
    }

    async fn ensure_table_exists(client: &DynamoDbClient, table_name: &str) -> MailboxResult<()> {
        match client.describe_table().table_name(table_name).send().await {
            Ok(_) => {
                debug!(table_name = %table_name, "DynamoDB table already exists");
                return Ok(());
            }
            Err(e) => {
                if !Self::error_code_is(&e, "ResourceNotFoundException") {
                    return Err(MailboxError::BackendError(format!(
                        "Failed to check table existence: {}",
                        e
                    )));
                }
            }
        }

        debug!(table_name = %table_name, "Creating DynamoDB table");

        let pk_key_schema = KeySchemaElement::builder()
            .attribute_name("connection_id")
            .key_type(KeyType::Hash)
            .build()
            .map_err(|e| MailboxError::BackendError(format!("Failed to build key schema: {}", e)))?;

        let sk_key_schema = KeySchemaElement::builder()
            .attribute_name("id")
            .key_type(KeyType::Range)
            .build()
            .map_err(|e| MailboxError::BackendError(format!("Failed to build key schema: {}", e)))?;

        let pk_attr = AttributeDefinition::builder()
            .attribute_name("connection_id")
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(|e| {
                MailboxError::BackendError(format!("Failed to build attribute definition: {}", e))
            })?;

        let sk_attr = AttributeDefinition::builder()
            .attribute_name("id")
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(|e| {
                MailboxError::BackendError(format!("Failed to build attribute definition: {}", e))
            })?;

        let create_table_result = client
            .create_table()
            .table_name(table_name)
            .billing_mode(BillingMode::PayPerRequest)
            .key_schema(pk_key_schema)
            .key_schema(sk_key_schema)
            .attribute_definitions(pk_attr)
            .attribute_definitions(sk_attr)
            .send()
            .await;

        match create_table_result {
            Ok(_) => Self::wait_for_table_active(client, table_name).await,
            Err(e) => {
                if Self::error_code_is(&e, "ResourceInUseException") {
                    debug!(table_name = %table_name, "Table created concurrently, waiting for active");
                    Self::wait_for_table_active(client, table_name).await
                } else {
                    Err(MailboxError::BackendError(format!(
                        "Failed to create DynamoDB table: {}",
                        e
                    )))
                }
            }
        }
    }

    async fn wait_for_table_active(
        client: &DynamoDbClient,
        table_name: &str,
    ) -> MailboxResult<()> {
        let mut attempts = 0;
        let max_attempts = 30;

        loop {
            let describe_result = client
                .describe_table()
                .table_name(table_name)
                .send()
                .await
                .map_err(|e| {
                    MailboxError::BackendError(format!("Failed to describe table: {}", e))
                })?;

            match describe_result.table().and_then(|t| t.table_status()) {
                Some(TableStatus::Active) => {
                    debug!(table_name = %table_name, "Table is now active");
                    return Ok(());
                }
                Some(TableStatus::Creating) => {
                    attempts += 1;
                    if attempts >= max_attempts {
                        return Err(MailboxError::BackendError(format!(
                            "Table creation timeout after {} attempts",
                            max_attempts
                        )));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                other => {
                    return Err(MailboxError::BackendError(format!(
                        "Table in unexpected status: {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// Sort key: zero-padded epoch millis + ULID, lexicographically ordered
    /// by arrival time.
    fn composite_id(received_at: DateTime<Utc>) -> String {
        format!("{:013}-{}", received_at.timestamp_millis(), Ulid::new())
    }

    /// True when the SDK error carries the given service error code.
    ///
    /// `SdkError`'s `Display` collapses every service error to the literal
    /// "service error", so detection has to go through the error metadata.
    fn error_code_is<E, R>(err: &SdkError<E, R>, code: &str) -> bool
    where
        E: ProvideErrorMetadata,
    {
        err.code() == Some(code)
    }

    fn item_to_envelope(item: &HashMap<String, AttributeValue>) -> MailboxResult<QueuedEnvelope> {
        let get_s = |name: &str| -> MailboxResult<String> {
            item.get(name)
                .and_then(|v| v.as_s().ok())
                .cloned()
                .ok_or_else(|| {
                    MailboxError::InvalidRecord(format!("Missing string attribute: {}", name))
                })
        };

        let state_str = get_s("state")?;
        let state = EnvelopeState::parse(&state_str).ok_or_else(|| {
            MailboxError::InvalidRecord(format!("Unknown envelope state: {}", state_str))
        })?;

        let recipient_dids = match item.get("recipient_dids").and_then(|v| v.as_l().ok()) {
            Some(list) => list
                .iter()
                .filter_map(|v| v.as_s().ok().cloned())
                .collect(),
            None => Vec::new(),
        };

        let encrypted_message = item
            .get("encrypted_message")
            .and_then(|v| v.as_b().ok())
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| {
                MailboxError::InvalidRecord("Missing binary attribute: encrypted_message".to_string())
            })?;

        let received_at_millis: i64 = item
            .get("received_at")
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| {
                MailboxError::InvalidRecord("Missing numeric attribute: received_at".to_string())
            })?;
        let received_at = Utc
            .timestamp_millis_opt(received_at_millis)
            .single()
            .ok_or_else(|| {
                MailboxError::InvalidRecord(format!(
                    "Out-of-range received_at: {}",
                    received_at_millis
                ))
            })?;

        Ok(QueuedEnvelope {
            id: get_s("id")?,
            connection_id: get_s("connection_id")?,
            recipient_dids,
            encrypted_message,
            state,
            received_at,
        })
    }

    /// Query all items of the connection in the given state, in sort-key
    /// (arrival) order, following pagination. A recipient identifier narrows
    /// the result to items listing it, within the connection's partition.
    async fn query_by_state(
        &self,
        connection_id: &str,
        state: EnvelopeState,
        recipient_did: Option<&str>,
        limit: Option<usize>,
    ) -> MailboxResult<Vec<HashMap<String, AttributeValue>>> {
        let mut items = Vec::new();
        let mut exclusive_start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let mut request = self
                .client
                .query()
                .table_name(&self.table_name)
                .key_condition_expression("connection_id = :cid")
                .expression_attribute_names("#s", "state")
                .expression_attribute_values(":cid", AttributeValue::S(connection_id.to_string()))
                .expression_attribute_values(":state", AttributeValue::S(state.as_str().to_string()));
            request = match recipient_did {
                Some(did) => request
                    .filter_expression("#s = :state AND contains(recipient_dids, :did)")
                    .expression_attribute_values(":did", AttributeValue::S(did.to_string())),
                None => request.filter_expression("#s = :state"),
            };
            if let Some(key) = exclusive_start_key.take() {
                request = request.set_exclusive_start_key(Some(key));
            }

            let response = request
                .send()
                .await
                .map_err(|e| MailboxError::BackendError(format!("Query failed: {}", e)))?;

            items.extend(response.items().iter().cloned());
            if let Some(limit) = limit {
                if items.len() >= limit {
                    items.truncate(limit);
                    return Ok(items);
                }
            }

            match response.last_evaluated_key() {
                Some(key) if !key.is_empty() => exclusive_start_key = Some(key.clone()),
                _ => return Ok(items),
            }
        }
    }

    /// Conditionally transition one item between states. Returns `false` when
    /// a concurrent claimer won the condition check.
    async fn transition_state(
        &self,
        connection_id: &str,
        id: &str,
        from: EnvelopeState,
        to: EnvelopeState,
    ) -> MailboxResult<bool> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("connection_id", AttributeValue::S(connection_id.to_string()))
            .key("id", AttributeValue::S(id.to_string()))
            .update_expression("SET #s = :to")
            .condition_expression("#s = :from")
            .expression_attribute_names("#s", "state")
            .expression_attribute_values(":to", AttributeValue::S(to.as_str().to_string()))
            .expression_attribute_values(":from", AttributeValue::S(from.as_str().to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if Self::error_code_is(&e, "ConditionalCheckFailedException") => Ok(false),
            Err(e) => Err(MailboxError::BackendError(format!(
                "Failed to transition message state: {}",
                e
            ))),
        }
    }
}

#[async_trait]
impl MailboxStore for DynamoDbMailbox {
    async fn get_available_message_count(&self, connection_id: &str) -> u64 {
        let mut count: u64 = 0;
        let mut exclusive_start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let mut request = self
                .client
                .query()
                .table_name(&self.table_name)
                .select(Select::Count)
                .key_condition_expression("connection_id = :cid")
                .filter_expression("#s = :state")
                .expression_attribute_names("#s", "state")
                .expression_attribute_values(":cid", AttributeValue::S(connection_id.to_string()))
                .expression_attribute_values(
                    ":state",
                    AttributeValue::S(EnvelopeState::Pending.as_str().to_string()),
                );
            if let Some(key) = exclusive_start_key.take() {
                request = request.set_exclusive_start_key(Some(key));
            }

            match request.send().await {
                Ok(response) => {
                    count += response.count() as u64;
                    match response.last_evaluated_key() {
                        Some(key) if !key.is_empty() => exclusive_start_key = Some(key.clone()),
                        _ => return count,
                    }
                }
                Err(err) => {
                    error!(
                        connection_id = %connection_id,
                        "Failed to count queued messages: {}", err
                    );
                    return 0;
                }
            }
        }
    }

    async fn take_from_queue(&self, options: TakeFromQueueOptions) -> Vec<QueuedEnvelope> {
        let candidates = match self
            .query_by_state(
                &options.connection_id,
                EnvelopeState::Pending,
                options.recipient_did.as_deref(),
                options.limit,
            )
            .await
        {
            Ok(items) => items,
            Err(err) => {
                error!(
                    connection_id = %options.connection_id,
                    "Failed to take from queue: {}", err
                );
                return Vec::new();
            }
        };

        let mut envelopes = Vec::with_capacity(candidates.len());
        for item in &candidates {
            let mut envelope = match Self::item_to_envelope(item) {
                Ok(envelope) => envelope,
                Err(err) => {
                    error!("Skipping undecodable queued_message item: {}", err);
                    continue;
                }
            };

            if options.delete_messages {
                let result = self
                    .client
                    .delete_item()
                    .table_name(&self.table_name)
                    .key(
                        "connection_id",
                        AttributeValue::S(envelope.connection_id.clone()),
                    )
                    .key("id", AttributeValue::S(envelope.id.clone()))
                    .condition_expression("#s = :pending")
                    .expression_attribute_names("#s", "state")
                    .expression_attribute_values(
                        ":pending",
                        AttributeValue::S(EnvelopeState::Pending.as_str().to_string()),
                    )
                    .send()
                    .await;
                match result {
                    Ok(_) => envelopes.push(envelope),
                    Err(e) if Self::error_code_is(&e, "ConditionalCheckFailedException") => {}
                    Err(e) => {
                        error!(message_id = %envelope.id, "Failed to delete queued message: {}", e);
                    }
                }
            } else {
                match self
                    .transition_state(
                        &envelope.connection_id,
                        &envelope.id,
                        EnvelopeState::Pending,
                        EnvelopeState::Sending,
                    )
                    .await
                {
                    Ok(true) => {
                        envelope.state = EnvelopeState::Sending;
                        envelopes.push(envelope);
                    }
                    // Lost the claim race, another instance took it
                    Ok(false) => {}
                    Err(err) => {
                        error!(message_id = %envelope.id, "Failed to claim queued message: {}", err);
                    }
                }
            }
        }

        envelopes
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

        let received_at = Utc::now();
        let envelope = QueuedEnvelope {
            id: Self::composite_id(received_at),
            connection_id: options.connection_id,
            recipient_dids: options.recipient_dids,
            encrypted_message: options.payload,
            state,
            received_at,
        };
        let id = envelope.id.clone();
        let recipient_dids = AttributeValue::L(
            envelope
                .recipient_dids
                .iter()
                .map(|did| AttributeValue::S(did.clone()))
                .collect(),
        );

        self.client
            .put_item()
            .table_name(&self.table_name)
            .item(
                "connection_id",
                AttributeValue::S(envelope.connection_id.clone()),
            )
            .item("id", AttributeValue::S(id.clone()))
            .item("recipient_dids", recipient_dids)
            .item(
                "encrypted_message",
                AttributeValue::B(Blob::new(envelope.encrypted_message.clone())),
            )
            .item("state", AttributeValue::S(state.as_str().to_string()))
            .item(
                "received_at",
                AttributeValue::N(received_at.timestamp_millis().to_string()),
            )
            .send()
            .await
            .map_err(|e| MailboxError::BackendError(format!("Failed to put message: {}", e)))?;

        debug!(
            connection_id = %envelope.connection_id,
            message_id = %id,
            state = %state,
            "Queued message"
        );
        self.events.publish(GatewayEvent::MessageQueued(envelope));

        Ok(id)
    }

    async fn remove_messages(
        &self,
        connection_id: &str,
        message_ids: &[String],
    ) -> MailboxResult<()> {
        for id in message_ids {
            // DeleteItem on an absent key succeeds, which matches the
            // idempotent contract
            self.client
                .delete_item()
                .table_name(&self.table_name)
                .key("connection_id", AttributeValue::S(connection_id.to_string()))
                .key("id", AttributeValue::S(id.clone()))
                .send()
                .await
                .map_err(|e| {
                    MailboxError::BackendError(format!("Failed to delete message {}: {}", id, e))
                })?;
        }
        Ok(())
    }

    async fn requeue_in_flight(&self, connection_id: &str) -> MailboxResult<u64> {
        let in_flight = self
            .query_by_state(connection_id, EnvelopeState::Sending, None, None)
            .await?;

        let mut reset = 0u64;
        for item in &in_flight {
            let id = match item.get("id").and_then(|v| v.as_s().ok()) {
                Some(id) => id.clone(),
                None => {
                    warn!("Skipping in-flight item without id attribute");
                    continue;
                }
            };
            if self
                .transition_state(
                    connection_id,
                    &id,
                    EnvelopeState::Sending,
                    EnvelopeState::Pending,
                )
                .await?
            {
                reset += 1;
            }
        }

        if reset > 0 {
            debug!(connection_id = %connection_id, reset, "Requeued in-flight messages");
        }
        Ok(reset)
    }

    fn bind_session_lookup(&self, lookup: Arc<dyn LocalSessionLookup>) {
        let _ = self.session_lookup.set(lookup);
    }
}

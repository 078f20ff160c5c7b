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

//! Configuration for the delivery orchestrator and notification fallback.
//!
//! ## Environment Variables
//! - `COURIER_FORWARDING_STRATEGY`: "queue-and-live-delivery" (default) or
//!   "queue-only". Any other value is fatal at startup.
//! - `COURIER_PUSH_PROJECT_IDS`: comma-separated provider project ids tried
//!   in order for push notifications (empty disables provider push)
//! - `COURIER_NOTIFICATION_TITLE`: push title (default: "New message")
//! - `COURIER_NOTIFICATION_BODY`: push body (default: "You have new
//!   messages waiting")
//! - `COURIER_WEBHOOK_URL`: optional webhook endpoint notified on fallback
//! - `COURIER_DELIVERY_BATCH_SIZE`: envelopes claimed per drain batch
//!   (default: 10)

use crate::{DeliveryError, DeliveryResult};

/// Who is responsible for the first local delivery attempt.
///
/// With `QueueAndLiveDelivery` the protocol layer already pushed the message
/// over the open channel before queuing it, so the orchestrator only acts on
/// remote/fallback routing. With `QueueOnly` every message lands in the
/// mailbox first and the orchestrator drives the local attempt too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingStrategy {
    /// Messages are only queued; the orchestrator drives local delivery.
    QueueOnly,
    /// The protocol layer delivers locally itself; the orchestrator handles
    /// remote hand-off and fallback.
    QueueAndLiveDelivery,
}

impl ForwardingStrategy {
    /// Parse the configuration string form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queue-only" => Some(ForwardingStrategy::QueueOnly),
            "queue-and-live-delivery" => Some(ForwardingStrategy::QueueAndLiveDelivery),
            _ => None,
        }
    }
}

/// Delivery orchestrator configuration.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// First-attempt responsibility split.
    pub forwarding_strategy: ForwardingStrategy,
    /// Provider project ids tried in order; empty disables provider push.
    pub push_project_ids: Vec<String>,
    /// Push notification title.
    pub notification_title: String,
    /// Push notification body.
    pub notification_body: String,
    /// Optional webhook endpoint notified on fallback.
    pub webhook_url: Option<String>,
    /// Envelopes claimed per drain batch.
    pub batch_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            forwarding_strategy: ForwardingStrategy::QueueAndLiveDelivery,
            push_project_ids: Vec::new(),
            notification_title: "New message".to_string(),
            notification_body: "You have new messages waiting".to_string(),
            webhook_url: None,
            batch_size: 10,
        }
    }
}

impl DeliveryConfig {
    /// Create configuration from environment variables.
    ///
    /// A strategy value that does not parse is a hard error: silently
    /// falling back to a default would change routing behavior fleet-wide.
    pub fn from_env() -> DeliveryResult<Self> {
        let defaults = DeliveryConfig::default();

        let forwarding_strategy = match std::env::var("COURIER_FORWARDING_STRATEGY") {
            Ok(value) => ForwardingStrategy::parse(&value).ok_or_else(|| {
                DeliveryError::ConfigError(format!(
                    "Unknown forwarding strategy: {}. Valid options: queue-only, queue-and-live-delivery",
                    value
                ))
            })?,
            Err(_) => defaults.forwarding_strategy,
        };

        let push_project_ids = std::env::var("COURIER_PUSH_PROJECT_IDS")
            .map(|ids| {
                ids.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            forwarding_strategy,
            push_project_ids,
            notification_title: std::env::var("COURIER_NOTIFICATION_TITLE")
                .unwrap_or(defaults.notification_title),
            notification_body: std::env::var("COURIER_NOTIFICATION_BODY")
                .unwrap_or(defaults.notification_body),
            webhook_url: std::env::var("COURIER_WEBHOOK_URL").ok(),
            batch_size: std::env::var("COURIER_DELIVERY_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.batch_size),
        })
    }
}

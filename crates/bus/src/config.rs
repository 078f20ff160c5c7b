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

//! Configuration support for delivery bus backends.
//!
//! ## Environment Variables
//!
//! ### Backend Selection
//! - `COURIER_BUS_BACKEND`: Backend type (default: "in-memory")
//!   - "in-memory" | "memory" → InMemoryDeliveryBus
//!   - "redis" → RedisDeliveryBus
//!
//! ### Instance Identity
//! - `COURIER_INSTANCE_ID`: Stable instance id (default: `courier-{ulid}`,
//!   fresh per process — fine for ephemeral instances, set it explicitly
//!   when streams must survive restarts)
//!
//! ### Redis Configuration
//! - `COURIER_BUS_REDIS_URL`: Redis server URL (default: "redis://localhost:6379")
//! - `COURIER_BUS_REGISTRY_TTL_SECS`: Ownership record TTL (default: 3600)
//! - `COURIER_BUS_BATCH_SIZE`: Entries per read/claim batch (default: 10)
//! - `COURIER_BUS_BLOCK_MS`: Blocking read timeout (default: 1000)
//! - `COURIER_BUS_CLAIM_INTERVAL_MS`: Recovery sweep interval (default: 15000)
//! - `COURIER_BUS_MIN_IDLE_MS`: Idle threshold before an unacknowledged
//!   entry is considered abandoned (default: 60000)

use crate::{BusError, BusResult, DeliveryBus, InMemoryDeliveryBus};
use std::sync::Arc;
use std::time::Duration;

/// Backend type configuration.
#[derive(Clone)]
pub enum BusBackend {
    /// In-memory backend (default, always available; single-process only)
    InMemory,
    /// Redis Streams backend (requires redis-backend feature)
    Redis {
        /// Redis server URL
        url: String,
    },
}

#[allow(clippy::derivable_impls)]
impl Default for BusBackend {
    fn default() -> Self {
        Self::InMemory
    }
}

/// Delivery bus configuration.
#[derive(Clone)]
pub struct BusConfig {
    /// Backend type
    pub backend: BusBackend,
    /// Stable id of the local instance
    pub instance_id: String,
    /// TTL of connection ownership records
    pub registry_ttl: Duration,
    /// Entries per read/claim batch
    pub batch_size: usize,
    /// Blocking read timeout
    pub block_ms: u64,
    /// Recovery sweep interval
    pub claim_interval: Duration,
    /// Idle threshold before an unacknowledged entry counts as abandoned
    pub min_idle: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::InMemory,
            instance_id: format!("courier-{}", ulid::Ulid::new()),
            registry_ttl: Duration::from_secs(3600),
            batch_size: 10,
            block_ms: 1000,
            claim_interval: Duration::from_millis(15_000),
            min_idle: Duration::from_millis(60_000),
        }
    }
}

impl BusConfig {
    /// Create configuration from environment variables.
    ///
    /// See module documentation for the complete variable list.
    pub fn from_env() -> BusResult<Self> {
        let backend_str = std::env::var("COURIER_BUS_BACKEND")
            .unwrap_or_else(|_| "in-memory".to_string())
            .to_lowercase();

        let backend = match backend_str.as_str() {
            "in-memory" | "memory" => BusBackend::InMemory,
            "redis" => {
                let url = std::env::var("COURIER_BUS_REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string());
                BusBackend::Redis { url }
            }
            other => {
                return Err(BusError::ConfigError(format!(
                    "Unknown backend type: {}. Valid options: in-memory, redis",
                    other
                )));
            }
        };

        let defaults = BusConfig::default();
        Ok(Self {
            backend,
            instance_id: std::env::var("COURIER_INSTANCE_ID")
                .unwrap_or(defaults.instance_id),
            registry_ttl: env_u64("COURIER_BUS_REGISTRY_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.registry_ttl),
            batch_size: env_u64("COURIER_BUS_BATCH_SIZE")
                .map(|v| v as usize)
                .unwrap_or(defaults.batch_size),
            block_ms: env_u64("COURIER_BUS_BLOCK_MS").unwrap_or(defaults.block_ms),
            claim_interval: env_u64("COURIER_BUS_CLAIM_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.claim_interval),
            min_idle: env_u64("COURIER_BUS_MIN_IDLE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.min_idle),
        })
    }

    /// Create configuration with explicit backend, defaults elsewhere.
    pub fn new(backend: BusBackend, instance_id: String) -> Self {
        Self {
            backend,
            instance_id,
            ..Default::default()
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Create a delivery bus from environment configuration.
pub async fn create_bus_from_env() -> BusResult<Arc<dyn DeliveryBus>> {
    let config = BusConfig::from_env()?;
    create_bus_from_config(config).await
}

/// Create a delivery bus from explicit configuration.
///
/// The in-memory backend joins a process-wide shared network so that several
/// logical "instances" constructed in one process can see each other.
pub async fn create_bus_from_config(config: BusConfig) -> BusResult<Arc<dyn DeliveryBus>> {
    match config.backend.clone() {
        BusBackend::InMemory => Ok(Arc::new(InMemoryDeliveryBus::new_on_shared_network(
            config.instance_id.clone(),
        ))),

        #[cfg(feature = "redis-backend")]
        BusBackend::Redis { url } => {
            use crate::redis_bus::RedisDeliveryBus;
            let bus = RedisDeliveryBus::new(&url, config).await?;
            Ok(Arc::new(bus))
        }

        #[cfg(not(feature = "redis-backend"))]
        BusBackend::Redis { .. } => Err(BusError::ConfigError(
            "Redis backend requires 'redis-backend' feature".to_string(),
        )),
    }
}

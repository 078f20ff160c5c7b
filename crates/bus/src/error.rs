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

//! Error types for bus operations.

use thiserror::Error;

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Error, Debug)]
pub enum BusError {
    /// Backend error (Redis, network, etc.)
    #[error("Bus backend error: {0}")]
    BackendError(String),

    /// A stream entry that cannot be decoded into a hand-off message.
    #[error("Invalid hand-off message: {0}")]
    InvalidMessage(String),

    /// Configuration error (missing or inconsistent settings).
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A handler declined the message; it stays pending for redelivery.
    #[error("Hand-off handler failed: {0}")]
    HandlerError(String),
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::BackendError(format!("Redis error: {}", err))
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::InvalidMessage(format!("JSON error: {}", err))
    }
}

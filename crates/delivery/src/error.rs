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

//! Error types for the delivery subsystem.

use courier_bus::BusError;
use courier_core::SessionStoreError;
use courier_mailbox::MailboxError;
use thiserror::Error;

/// Result type for delivery operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Errors that can occur in the directory and orchestrator.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Mailbox store failure.
    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    /// Delivery bus failure.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Shared session directory failure.
    #[error(transparent)]
    SessionStore(#[from] SessionStoreError),

    /// The protocol-layer transport failed to deliver over an open channel.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error (missing or inconsistent settings).
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Errors from push notification providers.
///
/// The split drives log severity and nothing else: a `Provider` error is an
/// expected per-project outcome (wrong project for this token, expired
/// token), an `Unexpected` error is an operational problem.
#[derive(Error, Debug)]
pub enum NotifyError {
    /// Provider rejected the send for this project/token pair.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Anything else (network, auth, serialization).
    #[error("Unexpected notification error: {0}")]
    Unexpected(String),
}

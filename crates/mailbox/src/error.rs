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

//! Error types for mailbox operations.

use thiserror::Error;

/// Result type for mailbox operations.
pub type MailboxResult<T> = Result<T, MailboxError>;

/// Errors that can occur during mailbox operations.
#[derive(Error, Debug)]
pub enum MailboxError {
    /// Backend error (database, network, etc.) — transient from the caller's
    /// point of view.
    #[error("Backend error: {0}")]
    BackendError(String),

    /// Invalid envelope or key data read back from a backend.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Configuration error (missing or inconsistent settings).
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

#[cfg(feature = "postgres-backend")]
impl From<sqlx::Error> for MailboxError {
    fn from(err: sqlx::Error) -> Self {
        MailboxError::BackendError(format!("SQL error: {}", err))
    }
}

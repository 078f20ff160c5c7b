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

//! # Courier Delivery
//!
//! ## Purpose
//! Ties the mailbox, the session directory and the delivery bus together
//! into the actual routing behavior:
//!
//! - [`LiveSessionDirectory`] — which connections hold an open channel, here
//!   and fleet-wide
//! - [`DeliveryOrchestrator`] — the local → remote → notify decision ladder
//! - [`NotificationFallback`] — multi-project provider push plus webhook,
//!   the last rung of the ladder
//!
//! The protocol layer plugs in through two seams: [`SessionTransport`]
//! (delivering over an open channel) and [`PushGateway`] /
//! [`NotificationRecordStore`] (provider push specifics).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod directory;
pub mod error;
pub mod notify;
pub mod orchestrator;

pub use config::{DeliveryConfig, ForwardingStrategy};
pub use directory::{InMemorySessionStore, LiveSessionDirectory};
pub use error::{DeliveryError, DeliveryResult, NotifyError};
pub use notify::{
    InMemoryNotificationStore, NotificationFallback, NotificationRecord, NotificationRecordStore,
    PushGateway,
};
pub use orchestrator::{DeliveryOrchestrator, SessionTransport};

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

//! # Courier Core
//!
//! ## Purpose
//! Shared domain types for the Courier store-and-forward mediator: the queued
//! envelope and live-session records, the typed gateway event bus, and the
//! seams (`LocalSessionLookup`, `SharedSessionStore`) that let the mailbox
//! backends and the delivery orchestrator cooperate without depending on each
//! other directly.
//!
//! ## Architecture Context
//! Every other Courier crate depends on this one:
//!
//! - **courier-mailbox**: stores [`QueuedEnvelope`] records and consults
//!   [`LocalSessionLookup`] to decide the initial envelope state on enqueue
//! - **courier-bus**: routes "message arrived for connection X" hand-offs
//!   between instances holding [`LiveSession`]s
//! - **courier-delivery**: owns the live-session directory and reacts to
//!   [`GatewayEvent`]s published on the [`EventBus`]
//!
//! ## Key Components
//! - [`QueuedEnvelope`] / [`EnvelopeState`]: one message waiting for a connection
//! - [`LiveSession`] / [`SessionRole`]: an open delivery channel held by one instance
//! - [`EventBus`] / [`GatewayEvent`]: typed pub/sub replacing stringly-typed
//!   event-emitter fan-out, so handler registration is statically checked

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod envelope;
pub mod events;
pub mod session;

pub use envelope::{EnvelopeState, QueuedEnvelope};
pub use events::{EventBus, GatewayEvent};
pub use session::{
    LiveSession, LocalSessionLookup, SessionRole, SessionStoreError, SharedSessionStore,
};

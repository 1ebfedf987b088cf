// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP API surface backed by the session engine.
//!
//! Session admin (start/stop/reconnect/reset), pairing QR as PNG, intent
//! toggles, health, queue inspection, and the send endpoints with their
//! send-or-enqueue contract.

pub mod auth;
pub mod handlers;
pub mod server;

pub use auth::AuthConfig;
pub use server::{build_router, start_server, GatewayState, HealthState, ServerConfig};

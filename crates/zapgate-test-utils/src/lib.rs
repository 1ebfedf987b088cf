// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test utilities for the Zapgate workspace: a scripted mock browser client
//! and an engine harness over temp SQLite and temp blob storage.

pub mod harness;
pub mod mock_client;

pub use harness::{fast_policy, EngineHarness, EngineHarnessBuilder};
pub use mock_client::{MockBehavior, MockClientFactory, MockWebClient};

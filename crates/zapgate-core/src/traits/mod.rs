// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Adapter trait definitions.

pub mod client;
pub mod store;

pub use client::{ClientFactory, WebClient};
pub use store::{BlobStore, MetadataStore};

// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistence for Zapgate: the SQLite instance metadata store and the
//! filesystem auth-blob store.
//!
//! The metadata store holds durable per-instance *intent* and last-known
//! connection state; the blob store holds one opaque auth archive per
//! session name. Both are consumed by the engine through the traits in
//! `zapgate-core`.

pub mod blobs;
pub mod database;
pub mod metadata;
pub mod migrations;
pub mod queries;

pub use blobs::FsBlobStore;
pub use database::Database;
pub use metadata::SqliteMetadataStore;

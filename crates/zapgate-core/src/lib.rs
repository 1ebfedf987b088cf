// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the Zapgate session engine.
//!
//! This crate provides the foundational trait definitions, error types, and
//! common types used throughout the Zapgate workspace: the browser client
//! adapter seam, the persistence seams, and the status/reason vocabulary the
//! state machine speaks.

pub mod error;
pub mod traits;
pub mod types;

// Re-export key items at crate root for ergonomic imports.
pub use error::ZapgateError;
pub use traits::{BlobStore, ClientFactory, MetadataStore, WebClient};
pub use types::{
    ClientEvent, ClientInfo, ClientState, DisconnectReason, InstanceRecord, InstanceStatus,
    MediaRef, MessageKind, PendingMessage, SendOutcome,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_variants_construct() {
        let _config = ZapgateError::Config("test".into());
        let _storage = ZapgateError::Storage {
            source: Box::new(std::io::Error::other("test")),
        };
        let _blob = ZapgateError::Blob {
            message: "test".into(),
            source: None,
        };
        let _client = ZapgateError::Client {
            message: "test".into(),
            source: None,
        };
        let _torn = ZapgateError::ClientTornDown;
        let _timeout = ZapgateError::Timeout {
            duration: std::time::Duration::from_secs(15),
        };
        let _not_found = ZapgateError::InstanceNotFound("a".into());
        let _internal = ZapgateError::Internal("test".into());
    }

    #[test]
    fn trait_objects_are_nameable() {
        // Compile-time check that the adapter seams stay object-safe.
        fn _client(_: &dyn WebClient) {}
        fn _factory(_: &dyn ClientFactory) {}
        fn _meta(_: &dyn MetadataStore) {}
        fn _blobs(_: &dyn BlobStore) {}
    }

    #[test]
    fn status_and_reason_are_exported() {
        assert_eq!(InstanceStatus::Connected.as_db_str(), "CONNECTED");
        assert!(DisconnectReason::Banned.is_permanent());
    }
}

// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Zapgate session engine.

use thiserror::Error;

/// The primary error type used across all Zapgate adapter traits and core operations.
#[derive(Debug, Error)]
pub enum ZapgateError {
    /// Configuration errors (invalid TOML, missing required fields, type mismatches).
    #[error("configuration error: {0}")]
    Config(String),

    /// Metadata store errors (database connection, query failure, migration).
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Auth blob store errors (archive missing after save, extract target absent).
    #[error("blob store error: {message}")]
    Blob {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Browser client adapter errors (initialize failure, send rejection, protocol).
    #[error("client error: {message}")]
    Client {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The browser context behind the adapter is gone (context destroyed,
    /// target closed). Callers in the probe and teardown paths swallow this
    /// variant; everywhere else it bubbles.
    #[error("client torn down")]
    ClientTornDown,

    /// Operation timed out.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// No instance row exists for the given id.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ZapgateError {
    /// True when the error message points at a torn-down browser context.
    ///
    /// The automation layer reports these as free-form strings; they are
    /// normalised here so every call site classifies them the same way.
    pub fn is_torn_down(&self) -> bool {
        match self {
            ZapgateError::ClientTornDown => true,
            ZapgateError::Client { message, .. } => {
                let m = message.to_ascii_lowercase();
                m.contains("context was destroyed")
                    || m.contains("execution context")
                    || m.contains("target closed")
                    || m.contains("session closed")
            }
            _ => false,
        }
    }

    /// True when a send failure indicates the underlying session dropped,
    /// meaning the message should be queued and the instance reconnected.
    pub fn indicates_disconnect(&self) -> bool {
        match self {
            ZapgateError::ClientTornDown | ZapgateError::Timeout { .. } => true,
            ZapgateError::Client { message, .. } => {
                let m = message.to_ascii_lowercase();
                m.contains("disconnect")
                    || m.contains("not connected")
                    || m.contains("session closed")
                    || m.contains("detached")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn torn_down_variant_is_detected() {
        assert!(ZapgateError::ClientTornDown.is_torn_down());
    }

    #[test]
    fn torn_down_message_is_detected() {
        let err = ZapgateError::Client {
            message: "Protocol error: Execution context was destroyed".into(),
            source: None,
        };
        assert!(err.is_torn_down());

        let err = ZapgateError::Client {
            message: "Target closed".into(),
            source: None,
        };
        assert!(err.is_torn_down());
    }

    #[test]
    fn ordinary_client_error_is_not_torn_down() {
        let err = ZapgateError::Client {
            message: "number not on whatsapp".into(),
            source: None,
        };
        assert!(!err.is_torn_down());
        assert!(!err.indicates_disconnect());
    }

    #[test]
    fn disconnect_classification() {
        let err = ZapgateError::Client {
            message: "WidFactory: session Closed".into(),
            source: None,
        };
        assert!(err.indicates_disconnect());

        let timeout = ZapgateError::Timeout {
            duration: std::time::Duration::from_secs(15),
        };
        assert!(timeout.indicates_disconnect());
    }
}

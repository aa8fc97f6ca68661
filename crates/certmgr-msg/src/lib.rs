//! ---
//! certmgr_section: "02-messaging-ipc-data-model"
//! certmgr_subsection: "module"
//! certmgr_type: "source"
//! certmgr_scope: "code"
//! certmgr_description: "Message envelopes and the pub/sub bus abstraction."
//! certmgr_version: "v0.1.0"
//! certmgr_owner: "platform"
//! ---
#![warn(missing_docs)]

pub mod transport;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised while encoding, decoding or moving messages.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// The envelope was produced by an incompatible schema.
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch {
        /// Version understood by this build.
        expected: u16,
        /// Version carried by the envelope.
        found: u16,
    },
    /// The envelope carried a different payload than the caller asked for.
    #[error("unexpected payload kind: expected {expected}, found {found}")]
    UnexpectedKind {
        /// Kind the caller asked for.
        expected: &'static str,
        /// Kind carried by the envelope.
        found: &'static str,
    },
    /// The bus could not serve the request.
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

pub use transport::{InMemoryBus, MessageBus, Subscription};
pub use types::{
    decode_payload, ClusterConfig, Message, MessagePayload, Payload, SslCertRequest,
    SslCertResponse, SCHEMA_VERSION,
};

//! ---
//! certmgr_section: "02-messaging-ipc-data-model"
//! certmgr_subsection: "module"
//! certmgr_type: "source"
//! certmgr_scope: "code"
//! certmgr_description: "Message envelopes and the pub/sub bus abstraction."
//! certmgr_version: "v0.1.0"
//! certmgr_owner: "platform"
//! ---
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{MessagingError, Result};

/// Schema version broadcast alongside every message payload.
pub const SCHEMA_VERSION: u16 = 1;

/// Payloads exchanged with the certificate authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Request for a fresh serving certificate.
    SslCertRequest(SslCertRequest),
    /// Certificate material issued by the authority.
    SslCertResponse(SslCertResponse),
    /// Operating mode of the cluster as seen by the authority.
    ClusterConfig(ClusterConfig),
}

impl MessagePayload {
    /// Wire name of the payload variant.
    pub fn kind(&self) -> &'static str {
        match self {
            MessagePayload::SslCertRequest(_) => SslCertRequest::KIND,
            MessagePayload::SslCertResponse(_) => SslCertResponse::KIND,
            MessagePayload::ClusterConfig(_) => ClusterConfig::KIND,
        }
    }
}

/// Unified envelope carried on every topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for deduplication and tracing.
    pub id: Uuid,
    /// Version of the schema used by the payload.
    pub schema_version: u16,
    /// Timestamp when the message was created.
    pub timestamp: DateTime<Utc>,
    /// Cluster the message originates from or is addressed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<Uuid>,
    /// Actual payload carried by the message.
    pub payload: MessagePayload,
}

impl Message {
    /// Construct a new message envelope around the provided payload.
    pub fn new(payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            schema_version: SCHEMA_VERSION,
            timestamp: Utc::now(),
            cluster_id: None,
            payload,
        }
    }

    /// Construct an envelope addressed to a cluster.
    pub fn for_cluster(cluster_id: Uuid, payload: MessagePayload) -> Self {
        Self {
            cluster_id: Some(cluster_id),
            ..Self::new(payload)
        }
    }

    /// Convenience accessor returning the payload kind as a static string.
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Serialise the envelope into the bytes placed on the bus.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse an envelope received from the bus.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let message: Message = serde_json::from_slice(raw)?;
        if message.schema_version != SCHEMA_VERSION {
            return Err(MessagingError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: message.schema_version,
            });
        }
        Ok(message)
    }
}

/// Typed view over one [`MessagePayload`] variant.
pub trait Payload: Sized {
    /// Wire name of the variant.
    const KIND: &'static str;

    /// Wrap the value into the shared payload enum.
    fn into_payload(self) -> MessagePayload;

    /// Extract the value, returning the payload untouched on mismatch.
    fn from_payload(payload: MessagePayload) -> std::result::Result<Self, MessagePayload>;
}

/// Decode raw bytes into the expected payload type.
///
/// Fails when the bytes are not a valid envelope, when the schema version is
/// unknown, or when the envelope carries a different payload kind.
pub fn decode_payload<T: Payload>(raw: &[u8]) -> Result<T> {
    let message = Message::decode(raw)?;
    T::from_payload(message.payload).map_err(|other| MessagingError::UnexpectedKind {
        expected: T::KIND,
        found: other.kind(),
    })
}

/// Request for a fresh serving certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslCertRequest {
    /// Identity of the requesting cluster.
    pub cluster_id: Uuid,
}

impl Payload for SslCertRequest {
    const KIND: &'static str = "ssl_cert_request";

    fn into_payload(self) -> MessagePayload {
        MessagePayload::SslCertRequest(self)
    }

    fn from_payload(payload: MessagePayload) -> std::result::Result<Self, MessagePayload> {
        match payload {
            MessagePayload::SslCertRequest(inner) => Ok(inner),
            other => Err(other),
        }
    }
}

/// Certificate material issued by the authority.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslCertResponse {
    /// PEM encoded private key.
    pub key: String,
    /// PEM encoded certificate chain.
    pub cert: String,
}

impl fmt::Debug for SslCertResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslCertResponse")
            .field("key", &"<redacted>")
            .field("cert_len", &self.cert.len())
            .finish()
    }
}

impl Payload for SslCertResponse {
    const KIND: &'static str = "ssl_cert_response";

    fn into_payload(self) -> MessagePayload {
        MessagePayload::SslCertResponse(self)
    }

    fn from_payload(payload: MessagePayload) -> std::result::Result<Self, MessagePayload> {
        match payload {
            MessagePayload::SslCertResponse(inner) => Ok(inner),
            other => Err(other),
        }
    }
}

/// Operating mode of the cluster as seen by the authority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Whether the serving component passes TLS through instead of terminating it.
    #[serde(default)]
    pub passthrough_enabled: bool,
}

impl Payload for ClusterConfig {
    const KIND: &'static str = "cluster_config";

    fn into_payload(self) -> MessagePayload {
        MessagePayload::ClusterConfig(self)
    }

    fn from_payload(payload: MessagePayload) -> std::result::Result<Self, MessagePayload> {
        match payload {
            MessagePayload::ClusterConfig(inner) => Ok(inner),
            other => Err(other),
        }
    }
}

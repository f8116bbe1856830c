//! Envelopes exchanged with the harness
//!
//! Every line on the transport is one JSON object:
//!
//! ```text
//! {"src":"c1","dest":"n1","body":{"type":"broadcast","msg_id":3,"message":42}}
//! ```
//!
//! The `body` always carries a `type` discriminant. Requests carry a
//! `msg_id`; replies carry `in_reply_to` pointing back at the request's
//! `msg_id`. Everything else in the body is message-specific and kept as
//! loose JSON until a handler decodes it into its own typed payload with
//! [`Body::decode`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{NodeError, NodeResult};

/// Type of the handshake message every node understands
pub const INIT: &str = "init";

/// Type of the handshake acknowledgment
pub const INIT_OK: &str = "init_ok";

/// One transport message: source, destination and structured body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending node or client id
    pub src: String,
    /// Receiving node or client id
    pub dest: String,
    /// Message payload
    pub body: Body,
}

impl Envelope {
    /// Create a new envelope
    pub fn new(src: impl Into<String>, dest: impl Into<String>, body: Body) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            body,
        }
    }

    /// Decode one transport line.
    ///
    /// Surrounding whitespace (including a trailing `\r`) is ignored.
    pub fn from_line(line: &[u8]) -> NodeResult<Self> {
        serde_json::from_slice(line.trim_ascii()).map_err(|e| NodeError::Decode(e.to_string()))
    }

    /// Encode to a single JSON line (no trailing newline).
    pub fn to_line(&self) -> NodeResult<String> {
        serde_json::to_string(self).map_err(|e| NodeError::Serialization(e.to_string()))
    }

    /// The body's message type
    pub fn msg_type(&self) -> &str {
        &self.body.kind
    }

    /// Whether this envelope answers an earlier request
    pub fn is_reply(&self) -> bool {
        self.body.in_reply_to.is_some()
    }
}

/// Message body with the routing fields pulled out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    /// Message type discriminant
    #[serde(rename = "type")]
    pub kind: String,

    /// Request id, present on requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,

    /// Correlation id, present on replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,

    /// Remaining message-specific fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Body {
    /// A body with only a type
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            msg_id: None,
            in_reply_to: None,
            fields: Map::new(),
        }
    }

    /// Build a body from any serializable payload.
    ///
    /// The payload must serialize to a JSON object with a string `type`
    /// field; tagged enums (`#[serde(tag = "type")]`) satisfy this. Any
    /// `msg_id`/`in_reply_to` the payload carries is kept.
    pub fn from_payload<T: Serialize + ?Sized>(payload: &T) -> NodeResult<Self> {
        let value =
            serde_json::to_value(payload).map_err(|e| NodeError::Serialization(e.to_string()))?;

        match value {
            Value::Object(_) => serde_json::from_value(value).map_err(|e| {
                NodeError::Serialization(format!("body needs a string `type` field: {}", e))
            }),
            other => Err(NodeError::Serialization(format!(
                "body must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Decode the body into a typed payload.
    ///
    /// `type` is included in the decoded object so internally tagged enums
    /// can pick their variant; a missing field or unexpected variant yields
    /// [`NodeError::MalformedBody`].
    pub fn decode<T: DeserializeOwned>(&self) -> NodeResult<T> {
        let mut object = self.fields.clone();
        object.insert("type".to_string(), Value::String(self.kind.clone()));
        serde_json::from_value(Value::Object(object))
            .map_err(|e| NodeError::malformed(self.kind.clone(), e))
    }

    /// Copy of this body stamped with a request id
    pub fn with_msg_id(mut self, msg_id: u64) -> Self {
        self.msg_id = Some(msg_id);
        self
    }

    /// Copy of this body stamped with a correlation id
    pub fn with_in_reply_to(mut self, in_reply_to: u64) -> Self {
        self.in_reply_to = Some(in_reply_to);
        self
    }

    /// Add or replace a message-specific field
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Look up a message-specific field
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Payload of the `init` handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitRequest {
    /// Id assigned to this node
    pub node_id: String,
    /// Every node id in the cluster, including this one
    pub node_ids: Vec<String>,
}

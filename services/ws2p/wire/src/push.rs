//! Push message kinds and payloads.
//!
//! A push is a fire-and-forget document sent over an authenticated session:
//! `{"body": {"name": "BLOCK", "block": {...}}}`.

use crate::error::WireError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Kind of document carried by a push message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushKind {
    /// Peer document
    Peer,
    /// Transaction document
    Transaction,
    /// Membership document
    Membership,
    /// Certification document
    Certification,
    /// Identity document
    Identity,
    /// Block document
    Block,
    /// Batch of head announcements
    Head,
}

impl PushKind {
    /// All push kinds, in wire enumeration order
    pub const ALL: [PushKind; 7] = [
        PushKind::Peer,
        PushKind::Transaction,
        PushKind::Membership,
        PushKind::Certification,
        PushKind::Identity,
        PushKind::Block,
        PushKind::Head,
    ];

    /// Value of the `name` field on the wire
    pub fn name(&self) -> &'static str {
        match self {
            PushKind::Peer => "PEER",
            PushKind::Transaction => "TRANSACTION",
            PushKind::Membership => "MEMBERSHIP",
            PushKind::Certification => "CERTIFICATION",
            PushKind::Identity => "IDENTITY",
            PushKind::Block => "BLOCK",
            PushKind::Head => "HEAD",
        }
    }

    /// Body key holding the payload
    pub fn payload_key(&self) -> &'static str {
        match self {
            PushKind::Peer => "peer",
            PushKind::Transaction => "transaction",
            PushKind::Membership => "membership",
            PushKind::Certification => "certification",
            PushKind::Identity => "identity",
            PushKind::Block => "block",
            PushKind::Head => "heads",
        }
    }

    /// Look a kind up by its wire name, ignoring case
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for PushKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A signed head as carried inside a HEAD push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadPayload {
    /// Canonical head string
    pub message: String,
    /// Base64 signature over `message`
    pub sig: String,
}

/// A push message
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    /// Document kind
    pub kind: PushKind,
    /// Opaque document payload
    pub payload: Value,
}

impl PushMessage {
    /// Create a push message for an opaque document
    pub fn new(kind: PushKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    /// Create a HEAD push for a batch of heads
    pub fn heads(heads: &[HeadPayload]) -> Self {
        let payload = heads
            .iter()
            .map(|h| {
                let mut obj = Map::new();
                obj.insert("message".into(), Value::String(h.message.clone()));
                obj.insert("sig".into(), Value::String(h.sig.clone()));
                Value::Object(obj)
            })
            .collect();
        Self {
            kind: PushKind::Head,
            payload: Value::Array(payload),
        }
    }

    /// Decode the `body` object of a push frame
    pub fn from_body(body: &Value) -> Result<Self, WireError> {
        let body = body.as_object().ok_or(WireError::Push)?;
        let kind = body
            .get("name")
            .and_then(Value::as_str)
            .and_then(PushKind::from_name)
            .ok_or(WireError::Push)?;
        let payload = body.get(kind.payload_key()).cloned().ok_or(WireError::Push)?;
        Ok(Self { kind, payload })
    }

    /// The `body` object of this push
    pub fn body(&self) -> Value {
        let mut body = Map::new();
        body.insert("name".into(), Value::String(self.kind.name().to_string()));
        body.insert(self.kind.payload_key().into(), self.payload.clone());
        Value::Object(body)
    }

    /// Extract the heads of a HEAD push.
    ///
    /// Entries that are not `{message, sig}` objects are skipped rather than
    /// failing the whole batch.
    pub fn head_payloads(&self) -> Result<Vec<HeadPayload>, WireError> {
        if self.kind != PushKind::Head {
            return Err(WireError::Push);
        }
        let entries = self.payload.as_array().ok_or(WireError::Push)?;
        Ok(entries
            .iter()
            .filter_map(|entry| serde_json::from_value::<HeadPayload>(entry.clone()).ok())
            .collect())
    }
}

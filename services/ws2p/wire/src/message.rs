//! JSON frames exchanged over a WS2P session.
//!
//! Every text frame is a JSON object. Its shape selects the message family:
//!
//! - `auth` present: handshake (`CONNECT`, `ACK`, `OK`)
//! - `reqId` present: request `{reqId, body: {name, params?}}`
//! - `resId` present: response `{resId, body}` or failure `{resId, err}`
//! - otherwise: push `{body: {name, <key>: payload}}`

use crate::error::WireError;
use crate::push::PushMessage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request names understood by WS2P peers
pub mod requests {
    /// Current block of the remote
    pub const CURRENT: &str = "CURRENT";
    /// Single block, params `{number}`
    pub const BLOCK_BY_NUMBER: &str = "BLOCK_BY_NUMBER";
    /// Block range, params `{count, fromNumber}`
    pub const BLOCKS_CHUNK: &str = "BLOCKS_CHUNK";
    /// Peer documents known to the remote
    pub const KNOWN_PEERS: &str = "KNOWN_PEERS";
    /// Heads known to the remote
    pub const HEADS: &str = "HEADS";
}

/// Handshake opener carrying a fresh challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Sender public key (base58)
    pub pubkey: String,
    /// Random challenge the remote must sign back
    pub challenge: String,
    /// Signature over `WS2P:CONNECT:<currency>:<pub>:<challenge>`
    pub sig: String,
    /// Currency name, when the sender advertises one
    pub currency: Option<String>,
}

/// Proof of possession of the key over the remote challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Acknowledging side public key
    pub pubkey: String,
    /// Signature over `WS2P:ACK:<currency>:<pub>:<remote challenge>`
    pub sig: String,
}

/// Final confirmation that the ACK was accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOk {
    /// Signature over `WS2P:OK:<currency>:<pub>:<own challenge>`
    pub sig: String,
}

/// Request body `{name, params?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    /// Request name, e.g. `BLOCK_BY_NUMBER`
    pub name: String,
    /// Request parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestBody {
    /// Create a request body without parameters
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: None,
        }
    }

    /// Attach parameters
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Read an unsigned integer parameter
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.as_ref()?.get(key)?.as_u64()
    }
}

/// A correlated request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation identifier chosen by the requester
    pub req_id: String,
    /// Request payload
    pub body: RequestBody,
}

/// Answer to a request, matched by `res_id`
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Identifier of the request being answered
    pub res_id: String,
    /// `Ok(body)` on success, `Err(err)` when the responder failed
    pub outcome: Result<Value, Value>,
}

/// Any message that can travel over a WS2P session
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// `auth: CONNECT`
    Connect(Connect),
    /// `auth: ACK`
    Ack(Ack),
    /// `auth: OK`
    Ok(AuthOk),
    /// Application request
    Request(Request),
    /// Application response
    Response(Response),
    /// Application push
    Push(PushMessage),
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

impl WireMessage {
    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Self, WireError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Decode an already-parsed JSON value
    pub fn from_value(value: Value) -> Result<Self, WireError> {
        let Value::Object(obj) = value else {
            return Err(WireError::NotAnObject);
        };

        if let Some(auth) = obj.get("auth").and_then(Value::as_str) {
            return Self::decode_auth(auth, &obj);
        }

        if let Some(req_id) = str_field(&obj, "reqId").filter(|id| !id.is_empty()) {
            let body = obj.get("body").cloned().ok_or(WireError::RequestBody)?;
            let body: RequestBody =
                serde_json::from_value(body).map_err(|_| WireError::RequestBody)?;
            return Ok(WireMessage::Request(Request { req_id, body }));
        }

        if let Some(res_id) = str_field(&obj, "resId").filter(|id| !id.is_empty()) {
            let outcome = match obj.get("err") {
                Some(err) if !err.is_null() => Err(err.clone()),
                _ => Ok(obj.get("body").cloned().unwrap_or(Value::Null)),
            };
            return Ok(WireMessage::Response(Response { res_id, outcome }));
        }

        let body = obj.get("body").ok_or(WireError::Push)?;
        Ok(WireMessage::Push(PushMessage::from_body(body)?))
    }

    fn decode_auth(auth: &str, obj: &Map<String, Value>) -> Result<Self, WireError> {
        match auth {
            "CONNECT" => {
                let pubkey = str_field(obj, "pub").ok_or(WireError::ConnectFields)?;
                let challenge = str_field(obj, "challenge").ok_or(WireError::ConnectFields)?;
                let sig = str_field(obj, "sig").ok_or(WireError::ConnectFields)?;
                Ok(WireMessage::Connect(Connect {
                    pubkey,
                    challenge,
                    sig,
                    currency: str_field(obj, "currency"),
                }))
            }
            "ACK" => {
                let pubkey = str_field(obj, "pub").ok_or(WireError::AckFields)?;
                let sig = str_field(obj, "sig").ok_or(WireError::AckFields)?;
                Ok(WireMessage::Ack(Ack { pubkey, sig }))
            }
            "OK" => {
                let sig = str_field(obj, "sig").ok_or(WireError::OkFields)?;
                Ok(WireMessage::Ok(AuthOk { sig }))
            }
            other => Err(WireError::UnknownAuth(other.to_string())),
        }
    }

    /// JSON representation of this message
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        match self {
            WireMessage::Connect(c) => {
                obj.insert("auth".into(), "CONNECT".into());
                obj.insert("pub".into(), c.pubkey.clone().into());
                obj.insert("challenge".into(), c.challenge.clone().into());
                obj.insert("sig".into(), c.sig.clone().into());
                if let Some(currency) = &c.currency {
                    obj.insert("currency".into(), currency.clone().into());
                }
            }
            WireMessage::Ack(a) => {
                obj.insert("auth".into(), "ACK".into());
                obj.insert("pub".into(), a.pubkey.clone().into());
                obj.insert("sig".into(), a.sig.clone().into());
            }
            WireMessage::Ok(o) => {
                obj.insert("auth".into(), "OK".into());
                obj.insert("sig".into(), o.sig.clone().into());
            }
            WireMessage::Request(r) => {
                obj.insert("reqId".into(), r.req_id.clone().into());
                obj.insert(
                    "body".into(),
                    serde_json::to_value(&r.body).unwrap_or(Value::Null),
                );
            }
            WireMessage::Response(r) => {
                obj.insert("resId".into(), r.res_id.clone().into());
                match &r.outcome {
                    Ok(body) => obj.insert("body".into(), body.clone()),
                    Err(err) => obj.insert("err".into(), err.clone()),
                };
            }
            WireMessage::Push(p) => {
                obj.insert("body".into(), p.body());
            }
        }
        Value::Object(obj)
    }

    /// Encode to a text frame
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }

    /// True for CONNECT, ACK and OK
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            WireMessage::Connect(_) | WireMessage::Ack(_) | WireMessage::Ok(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::PushKind;
    use serde_json::json;

    #[test]
    fn test_non_object_frames_are_rejected() {
        assert!(matches!(WireMessage::decode("42"), Err(WireError::NotAnObject)));
        assert!(matches!(WireMessage::decode("[1,2]"), Err(WireError::NotAnObject)));
        assert!(matches!(WireMessage::decode("{nope"), Err(WireError::Json(_))));
    }

    #[test]
    fn test_connect_missing_challenge() {
        let frame = json!({"auth": "CONNECT", "pub": "abc", "sig": "s"}).to_string();
        assert!(matches!(
            WireMessage::decode(&frame),
            Err(WireError::ConnectFields)
        ));
    }

    #[test]
    fn test_unknown_auth_value() {
        let frame = json!({"auth": "HELLO"}).to_string();
        match WireMessage::decode(&frame) {
            Err(WireError::UnknownAuth(name)) => assert_eq!(name, "HELLO"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failure_response_keeps_err_payload() {
        let frame = json!({"resId": "r1", "err": "boom"}).to_string();
        let WireMessage::Response(resp) = WireMessage::decode(&frame).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(resp.res_id, "r1");
        assert_eq!(resp.outcome, Err(json!("boom")));
    }

    #[test]
    fn test_request_encoding_shape() {
        let msg = WireMessage::Request(Request {
            req_id: "abc".into(),
            body: RequestBody::new("BLOCK_BY_NUMBER").with_params(json!({"number": 7})),
        });
        assert_eq!(
            msg.to_value(),
            json!({"reqId": "abc", "body": {"name": "BLOCK_BY_NUMBER", "params": {"number": 7}}})
        );
        let WireMessage::Request(req) = WireMessage::decode(&msg.encode()).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(req.body.param_u64("number"), Some(7));
    }

    #[test]
    fn test_push_frame_decodes_lowercase_name() {
        let frame = json!({"body": {"name": "peer", "peer": {"pubkey": "x"}}}).to_string();
        let WireMessage::Push(push) = WireMessage::decode(&frame).unwrap() else {
            panic!("expected push");
        };
        assert_eq!(push.kind, PushKind::Peer);
    }
}

//! Wire messages for the WS2P peer-to-peer session protocol.
//!
//! Every WS2P frame is a JSON text frame. This crate decodes frames once at the
//! socket boundary into a tagged [`WireMessage`] and provides the string
//! grammars shared by peers.
//!
//! ## Features
//!
//! - **Handshake Messages**: `CONNECT`, `ACK` and `OK` with their signed payloads
//! - **Request/Response**: correlated by `reqId`/`resId`, failures carried in `err`
//! - **Push Documents**: peer, transaction, membership, certification, identity, block, heads
//! - **Head Grammar**: v0 and v1 head announcements and blockstamps
//! - **Endpoints**: `WS2P <instanceId> <host> <port> [path]` parsing and URL building
//!
//! ## Frame Shapes
//!
//! ```text
//! {"auth": "CONNECT", "pub", "challenge", "sig", "currency"?}
//! {"auth": "ACK", "pub", "sig"}
//! {"auth": "OK", "sig"}
//! {"reqId", "body": {"name", "params"?}}
//! {"resId", "body"} | {"resId", "err"}
//! {"body": {"name", <payload key>}}
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod endpoint;
pub mod error;
pub mod head;
pub mod message;
pub mod push;

// Re-export main types
pub use address::full_address;
pub use endpoint::Ws2pEndpoint;
pub use error::WireError;
pub use head::{
    is_hash_format, is_instance_id_format, is_pubkey_format, is_signature_format, Blockstamp,
    Head, HeadVersion, DEFAULT_INSTANCE_ID,
};
pub use message::{requests, Ack, AuthOk, Connect, Request, RequestBody, Response, WireMessage};
pub use push::{HeadPayload, PushKind, PushMessage};

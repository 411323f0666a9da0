//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame is not valid JSON
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is valid JSON but not an object
    #[error("message must be an object")]
    NotAnObject,

    /// CONNECT with missing or mistyped fields
    #[error("invalid CONNECT fields")]
    ConnectFields,

    /// ACK with missing or mistyped fields
    #[error("invalid ACK fields")]
    AckFields,

    /// OK with missing or mistyped fields
    #[error("invalid OK fields")]
    OkFields,

    /// Unknown value in the `auth` field
    #[error("unknown auth message {0}")]
    UnknownAuth(String),

    /// Request whose body is not `{name, params?}`
    #[error("malformed request body")]
    RequestBody,

    /// Response without `body` nor `err`
    #[error("malformed response")]
    Response,

    /// Push whose body has no known `name` or lacks its payload key
    #[error("malformed push message")]
    Push,

    /// Head message not matching the v0/v1 grammar
    #[error("head wrong format")]
    HeadFormat,

    /// Blockstamp not of the form `number-HASH`
    #[error("invalid blockstamp {0}")]
    Blockstamp(String),

    /// Endpoint string not of the form `WS2P <uuid> <host> <port> [path]`
    #[error("invalid endpoint {0}")]
    Endpoint(String),
}

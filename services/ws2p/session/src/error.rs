//! Session error taxonomy.

use thiserror::Error;

/// Protocol and authentication faults counted against a session.
///
/// Each occurrence increments the session error counter; reaching the ceiling
/// terminates the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCause {
    /// CONNECT refused by admission or carrying a bad signature
    RejectedPubkeyOrIncorrectAskSignature,
    /// ACK key refused by the admission policy
    RejectedAckPubkey,
    /// CONNECT with missing or mistyped fields
    AuthInvalidAskFields,
    /// ACK with missing or mistyped fields
    AuthInvalidAckFields,
    /// OK with missing or mistyped fields
    AuthInvalidOkFields,
    /// ACK signature does not verify
    IncorrectAckSignature,
    /// OK signature does not verify
    IncorrectOkSignature,
    /// `auth` field with an unknown value
    UnknownAuthMessage,
    /// OK received after the remote already confirmed
    AlreadyAuthenticatedAndConfirmedByRemote,
    /// ACK received after the remote was already authenticated
    AlreadyAuthenticatedRemote,
    /// CONNECT received after the remote already authenticated us
    AlreadyAuthenticatedByRemote,
    /// CONNECT or ACK pubkey differs from the pinned key
    IncorrectPubkeyForRemote,
    /// Application message before the handshake completed
    MustBeAuthenticatedFirst,
    /// Remote answered a request with `err`
    RequestFailed,
    /// Request left unanswered past the timeout
    RequestTimeout,
    /// Frame is not a JSON object
    MessageMustBeAnObject,
    /// Response whose id matches no pending request
    AnswerToUndefinedRequest,
}

impl ErrorCause {
    /// Stable upper-case name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCause::RejectedPubkeyOrIncorrectAskSignature => {
                "REJECTED_PUBKEY_OR_INCORRECT_ASK_SIGNATURE_FROM_REMOTE"
            }
            ErrorCause::RejectedAckPubkey => "REJECTED_PUBKEY_FROM_REMOTE",
            ErrorCause::AuthInvalidAskFields => "AUTH_INVALID_ASK_FIELDS",
            ErrorCause::AuthInvalidAckFields => "AUTH_INVALID_ACK_FIELDS",
            ErrorCause::AuthInvalidOkFields => "AUTH_INVALID_OK_FIELDS",
            ErrorCause::IncorrectAckSignature => "INCORRECT_ACK_SIGNATURE_FROM_REMOTE",
            ErrorCause::IncorrectOkSignature => "INCORRECT_OK_SIGNATURE_FROM_REMOTE",
            ErrorCause::UnknownAuthMessage => "UNKNOWN_AUTH_MESSAGE",
            ErrorCause::AlreadyAuthenticatedAndConfirmedByRemote => {
                "ALREADY_AUTHENTICATED_AND_CONFIRMED_BY_REMOTE"
            }
            ErrorCause::AlreadyAuthenticatedRemote => "ALREADY_AUTHENTICATED_REMOTE",
            ErrorCause::AlreadyAuthenticatedByRemote => "ALREADY_AUTHENTICATED_BY_REMOTE",
            ErrorCause::IncorrectPubkeyForRemote => "INCORRECT_PUBKEY_FOR_REMOTE",
            ErrorCause::MustBeAuthenticatedFirst => "MUST_BE_AUTHENTICATED_FIRST",
            ErrorCause::RequestFailed => "REQUEST_FAILED",
            ErrorCause::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCause::MessageMustBeAnObject => "MESSAGE_MUST_BE_AN_OBJECT",
            ErrorCause::AnswerToUndefinedRequest => "ANSWER_TO_UNDEFINED_REQUEST",
        }
    }
}

impl std::fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Handshake failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Remote key refused by the admission policy
    #[error("pubkey {0} rejected")]
    Rejected(String),

    /// CONNECT signature does not verify
    #[error("Wrong signature from remote CONNECT")]
    WrongConnectSignature,

    /// ACK signature does not verify
    #[error("Wrong signature from server ACK")]
    WrongAckSignature,

    /// OK signature does not verify
    #[error("Wrong signature from remote OK")]
    WrongOkSignature,

    /// Remote advertises another currency
    #[error("wrong currency detected: expected {expected}, got {got}")]
    WrongCurrency {
        /// Local currency
        expected: String,
        /// Currency advertised by the remote
        got: String,
    },

    /// Remote key differs from the pinned one
    #[error("incorrect pubkey for remote: expected {expected}, got {got}")]
    IncorrectPubkey {
        /// Pinned key
        expected: String,
        /// Key presented by the remote
        got: String,
    },
}

/// Errors surfaced to users of a connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Handshake did not complete in time
    #[error("WS2P connection timeout")]
    ConnectionTimeout,

    /// Request left unanswered past the timeout
    #[error("WS2P request timeout")]
    RequestTimeout,

    /// Remote answered with `err`
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// Handshake failed
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Socket is closed
    #[error("connection closed")]
    Closed,

    /// Could not open the socket
    #[error("transport error: {0}")]
    Transport(String),
}

//! Authenticated, multiplexed WS2P sessions over WebSockets.
//!
//! This crate provides the per-connection side of WS2P: a three-message
//! mutual authentication, request/response correlation, push delivery and
//! the inbound/outbound glue that opens sessions.
//!
//! ## Features
//!
//! - **Handshake Protocol**: CONNECT, ACK and OK signed with ed25519 keys
//! - **Request Multiplexing**: concurrent requests correlated by id, with timeouts
//! - **Push Delivery**: documents handed to the application in arrival order
//! - **Fault Ceiling**: protocol faults are counted and terminate the socket
//! - **Server/Client**: inbound table hygiene and outbound dialing
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ws2p_session::{AcceptAll, Client, ConnectionOptions, KeyPair, MutedHandler};
//! use ws2p_wire::RequestBody;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = Client::new(
//!     "g1",
//!     Arc::new(KeyPair::generate()),
//!     Arc::new(MutedHandler),
//!     ConnectionOptions::default(),
//! );
//! let connection = client
//!     .connect_to("ws://127.0.0.1:20901", None, None, Arc::new(AcceptAll))
//!     .await?;
//! let current = connection.request(RequestBody::new("CURRENT")).await?;
//! println!("remote head: {}", current);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod client;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod handler;
pub mod server;

pub use auth::{
    AcceptAll, AdmissionPolicy, LocalAuth, NoLocalAuth, NoRemoteAuth, PubkeyLocalAuth,
    PubkeyRemoteAuth, RemoteAuth,
};
pub use client::Client;
pub use connection::{
    Connection, ConnectionConfig, ConnectionOptions, ConnectionStats, CONNECTION_TIMEOUT,
    MAXIMUM_ERRORS_COUNT, REQUEST_TIMEOUT,
};
pub use crypto::{verify, CryptoError, KeyPair};
pub use error::{AuthError, ConnectionError, ErrorCause};
pub use handler::{MessageHandler, MutedHandler};
pub use server::{Server, ServerPolicy, ServerSettings};

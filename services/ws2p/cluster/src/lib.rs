//! WS2P cluster overlay.
//!
//! The cluster manages every session of a node: the outbound ones it opens
//! (level 1) and the inbound ones its server accepts (level 2). It applies the
//! admission policy to both tiers, trims them back under their ceilings,
//! gossips signed heads, bans keys that keep sending invalid documents and
//! pulls blocks from its peers.
//!
//! ## Features
//!
//! - **Admission Control**: bans, prefered/privileged keys, member priority
//! - **Churn**: duplicate removal and low-priority eviction on both tiers
//! - **Head Gossip**: monotonic head cache with debounced rebroadcast
//! - **Offense Tracking**: repeated invalid documents lead to timed bans
//! - **Crawling**: periodic peer discovery and block pulling
//! - **Status Events**: connect, disconnect, ban and gossip notifications
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ws2p_cluster::{Cluster, ClusterConfig, MemoryChain};
//! use ws2p_session::KeyPair;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cluster = Cluster::new(
//!     ClusterConfig::default(),
//!     Arc::new(KeyPair::generate()),
//!     Arc::new(MemoryChain::new()),
//! )?;
//! let addr = cluster.listen().await?;
//! println!("listening on {}", addr);
//! cluster.start_crawling();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admission;
pub mod bans;
pub mod chain;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
mod handler;
pub mod heads;
pub mod puller;
pub mod requester;

pub use admission::{Admission, AdmissionQuery};
pub use bans::{BanList, OffenseLog};
pub use chain::{blockstamp_of, document_hash, ChainBackend, MemoryChain, PeerRecord};
pub use cluster::Cluster;
pub use config::ClusterConfig;
pub use error::ClusterError;
pub use events::{ClusterEvent, ConnectionLevel};
pub use heads::{HeadCache, HeadRecord};
pub use puller::BlockPuller;
pub use requester::Requester;

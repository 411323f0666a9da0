//! Cluster-wide constants.

use std::time::Duration;

/// Delay during which accepted heads are batched before being spread
pub const HEADS_SPREAD_TIMEOUT: Duration = Duration::from_millis(100);
/// How long a banned key is refused
pub const BAN_DURATION: Duration = Duration::from_secs(120);
/// Resubmissions of the same invalid document that trigger a ban
pub const BAN_ON_REPEAT_THRESHOLD: u32 = 5;
/// Window during which an invalid document is remembered
pub const ERROR_RECALL_DURATION: Duration = Duration::from_secs(60);

/// Outbound (level 1) ceiling
pub const MAX_LEVEL_1_PEERS: usize = 5;
/// Inbound (level 2) ceiling
pub const MAX_LEVEL_2_PEERS: usize = 20;

/// Period of peer discovery and reconnection
pub const RECONNECTION_INTERVAL: Duration = Duration::from_secs(600);
/// Period of block pulling
pub const BLOCK_PULLING_INTERVAL: Duration = Duration::from_secs(600);
/// Period of the expiry sweep over bans, offenses and caches
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Blocks asked per BLOCKS_CHUNK request
pub const BLOCKS_CHUNK_SIZE: u64 = 50;
/// Sessions picked for each pulling shot
pub const CRAWL_PEERS_COUNT: usize = 2;

/// Priority granted to chain members
pub const MEMBER_KEY_LEVEL: u8 = 1;
/// Priority granted to prefered (outbound) or privileged (inbound) keys
pub const PREFERED_PRIVILEGED_KEY_LEVEL: u8 = 2;
/// Priority granted to our own key
pub const SELF_KEY_LEVEL: u8 = 4;
/// Highest reachable priority
pub const MAX_PRIORITY_LEVEL: u8 = MEMBER_KEY_LEVEL + PREFERED_PRIVILEGED_KEY_LEVEL + SELF_KEY_LEVEL;

/// Instance id that never designates a real endpoint
pub const NULL_INSTANCE_ID: &str = "11111111";

/// Software name written in our heads
pub const SOFTWARE: &str = "ws2p";
/// Software version written in our heads
pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Default proof-of-work prefix written in our heads
pub const DEFAULT_POW_PREFIX: u32 = 1;

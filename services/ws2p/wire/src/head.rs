//! Head announcements and blockstamps.
//!
//! A head is the canonical string a node signs to announce its chain tip:
//!
//! - v0: `WS2P:HEAD:<pub>:<number>-<hash>`
//! - v1: `WS2P:HEAD:1:<pub>:<number>-<hash>:<instanceId>:<software>:<version>:<prefix>`
//!
//! The leading `WS2P` may carry access suffixes such as `WS2POCA` or `WS2PIC`.

use crate::error::WireError;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Instance id attributed to v0 heads, which carry none
pub const DEFAULT_INSTANCE_ID: &str = "00000000";

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// True when `s` looks like a base58 ed25519 public key
pub fn is_pubkey_format(s: &str) -> bool {
    (43..=44).contains(&s.len()) && s.chars().all(|c| BASE58_ALPHABET.contains(c))
}

/// True when `s` is a 64-char upper-case hex hash
pub fn is_hash_format(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
}

/// True when `s` is an 8-char lower-case hex instance id
pub fn is_instance_id_format(s: &str) -> bool {
    s.len() == 8 && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// True when `s` is an 88-char base64 ed25519 signature
pub fn is_signature_format(s: &str) -> bool {
    s.len() == 88
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
}

fn is_api_label(s: &str) -> bool {
    let Some(mut rest) = s.strip_prefix("WS2P") else {
        return false;
    };
    // O[CT][SAM]?
    if let Some(r) = rest.strip_prefix('O') {
        let Some(r) = r.strip_prefix(['C', 'T']) else {
            return false;
        };
        rest = r.strip_prefix(['S', 'A', 'M']).unwrap_or(r);
    }
    // I[CT]
    if let Some(r) = rest.strip_prefix('I') {
        let Some(r) = r.strip_prefix(['C', 'T']) else {
            return false;
        };
        rest = r;
    }
    rest.is_empty()
}

/// A chain position: block number and block hash
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Blockstamp {
    /// Block number
    pub number: u64,
    /// Block hash, upper-case hex
    pub hash: String,
}

impl Blockstamp {
    /// Create a blockstamp
    pub fn new(number: u64, hash: impl Into<String>) -> Self {
        Self {
            number,
            hash: hash.into(),
        }
    }
}

impl PartialOrd for Blockstamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Blockstamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number
            .cmp(&other.number)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl fmt::Display for Blockstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.number, self.hash)
    }
}

impl FromStr for Blockstamp {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (number, hash) = s
            .split_once('-')
            .ok_or_else(|| WireError::Blockstamp(s.to_string()))?;
        if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) || !is_hash_format(hash)
        {
            return Err(WireError::Blockstamp(s.to_string()));
        }
        let number = number
            .parse()
            .map_err(|_| WireError::Blockstamp(s.to_string()))?;
        Ok(Self::new(number, hash))
    }
}

/// Head grammar version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadVersion {
    /// Pubkey and blockstamp only
    V0,
    /// Adds instance id, software and proof-of-work prefix
    V1,
}

/// A parsed head announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    /// API label, `WS2P` plus optional access suffixes
    pub api: String,
    /// Grammar version
    pub version: HeadVersion,
    /// Issuer public key
    pub pubkey: String,
    /// Announced chain tip
    pub blockstamp: Blockstamp,
    /// Issuing instance, [`DEFAULT_INSTANCE_ID`] for v0
    pub instance_id: String,
    /// Software name (v1)
    pub software: Option<String>,
    /// Software version (v1)
    pub software_version: Option<String>,
    /// Proof-of-work prefix (v1)
    pub pow_prefix: Option<u32>,
}

impl Head {
    /// Build a v1 head
    pub fn v1(
        pubkey: impl Into<String>,
        blockstamp: Blockstamp,
        instance_id: impl Into<String>,
        software: impl Into<String>,
        software_version: impl Into<String>,
        pow_prefix: u32,
    ) -> Self {
        Self {
            api: "WS2P".to_string(),
            version: HeadVersion::V1,
            pubkey: pubkey.into(),
            blockstamp,
            instance_id: instance_id.into(),
            software: Some(software.into()),
            software_version: Some(software_version.into()),
            pow_prefix: Some(pow_prefix),
        }
    }

    /// Parse a canonical head string
    pub fn parse(message: &str) -> Result<Self, WireError> {
        let parts: Vec<&str> = message.split(':').collect();
        match parts.as_slice() {
            [api, "HEAD", pubkey, blockstamp] => {
                if !is_api_label(api) || !is_pubkey_format(pubkey) {
                    return Err(WireError::HeadFormat);
                }
                Ok(Self {
                    api: api.to_string(),
                    version: HeadVersion::V0,
                    pubkey: pubkey.to_string(),
                    blockstamp: blockstamp.parse().map_err(|_| WireError::HeadFormat)?,
                    instance_id: DEFAULT_INSTANCE_ID.to_string(),
                    software: None,
                    software_version: None,
                    pow_prefix: None,
                })
            }
            [api, "HEAD", "1", pubkey, blockstamp, instance_id, software, version, prefix] => {
                let valid = is_api_label(api)
                    && is_pubkey_format(pubkey)
                    && is_instance_id_format(instance_id)
                    && !software.is_empty()
                    && software
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                    && !version.is_empty()
                    && version.chars().all(|c| c.is_ascii_digit() || c == '.')
                    && !prefix.is_empty()
                    && prefix.chars().all(|c| c.is_ascii_digit());
                if !valid {
                    return Err(WireError::HeadFormat);
                }
                Ok(Self {
                    api: api.to_string(),
                    version: HeadVersion::V1,
                    pubkey: pubkey.to_string(),
                    blockstamp: blockstamp.parse().map_err(|_| WireError::HeadFormat)?,
                    instance_id: instance_id.to_string(),
                    software: Some(software.to_string()),
                    software_version: Some(version.to_string()),
                    pow_prefix: Some(prefix.parse().map_err(|_| WireError::HeadFormat)?),
                })
            }
            _ => Err(WireError::HeadFormat),
        }
    }

    /// Render the canonical string to sign
    pub fn to_message(&self) -> String {
        match self.version {
            HeadVersion::V0 => format!("{}:HEAD:{}:{}", self.api, self.pubkey, self.blockstamp),
            HeadVersion::V1 => format!(
                "{}:HEAD:1:{}:{}:{}:{}:{}:{}",
                self.api,
                self.pubkey,
                self.blockstamp,
                self.instance_id,
                self.software.as_deref().unwrap_or_default(),
                self.software_version.as_deref().unwrap_or_default(),
                self.pow_prefix.unwrap_or_default()
            ),
        }
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_message())
    }
}

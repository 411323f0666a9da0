//! Admission control.
//!
//! Decides whether a key may occupy a connection slot, for either tier.
//! Priority levels order the keys when a slot has to be freed: members,
//! then prefered or privileged keys, then our own key weigh more.

use crate::bans::BanList;
use crate::chain::ChainBackend;
use crate::constants::{
    MEMBER_KEY_LEVEL, NULL_INSTANCE_ID, PREFERED_PRIVILEGED_KEY_LEVEL, SELF_KEY_LEVEL,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// A candidate and the state of the tier it wants to join
#[derive(Debug, Clone, Copy)]
pub struct AdmissionQuery<'a> {
    /// Candidate key
    pub pubkey: &'a str,
    /// Keys connected at either tier
    pub connected_pubkeys: &'a [String],
    /// Instance ids of the connected endpoints, when known
    pub connected_instances: &'a [String],
    /// Sessions currently counted against the ceiling
    pub count: usize,
    /// Ceiling of the tier
    pub max: usize,
    /// Prefered keys (outbound) or privileged keys (inbound)
    pub priority_keys: &'a [String],
    /// Refuse keys outside `priority_keys`
    pub priority_only: bool,
    /// Instance id of the endpoint being dialed
    pub target_instance: Option<&'a str>,
}

/// Admission predicate shared by both tiers
pub struct Admission {
    own_pubkey: String,
    own_instance: String,
    backend: Arc<dyn ChainBackend>,
    bans: Arc<BanList>,
}

impl Admission {
    /// Create the predicate for the node `own_pubkey` running as `own_instance`
    pub fn new(
        own_pubkey: impl Into<String>,
        own_instance: impl Into<String>,
        backend: Arc<dyn ChainBackend>,
        bans: Arc<BanList>,
    ) -> Self {
        Self {
            own_pubkey: own_pubkey.into(),
            own_instance: own_instance.into(),
            backend,
            bans,
        }
    }

    async fn is_member(&self, pubkey: &str) -> bool {
        match self.backend.is_member(pubkey).await {
            Ok(member) => member,
            Err(e) => {
                warn!("Membership lookup of {} failed: {:#}", pubkey, e);
                false
            }
        }
    }

    /// Priority of `pubkey`; lower levels are evicted first
    pub async fn key_priority_level(&self, pubkey: &str, priority_keys: &[String]) -> u8 {
        let mut level = 0;
        if self.is_member(pubkey).await {
            level += MEMBER_KEY_LEVEL;
        }
        if priority_keys.iter().any(|k| k == pubkey) {
            level += PREFERED_PRIVILEGED_KEY_LEVEL;
        }
        if pubkey == self.own_pubkey {
            level += SELF_KEY_LEVEL;
        }
        level
    }

    /// Whether the candidate may take a slot
    pub async fn accept_pubkey(&self, query: AdmissionQuery<'_>) -> bool {
        let pubkey = query.pubkey;
        let is_new_instance = |target: &str| !query.connected_instances.iter().any(|i| i == target);

        if pubkey == self.own_pubkey {
            return match query.target_instance {
                None => true,
                Some(target) if target == self.own_instance || target == NULL_INSTANCE_ID => {
                    debug!("Refusing connection to our own instance {}", target);
                    false
                }
                Some(target) => is_new_instance(target),
            };
        }

        if let Some(reason) = self.bans.ban_reason(pubkey).await {
            warn!("Connection to {} refused, reason: {}", short(pubkey), reason);
            return false;
        }

        if query.priority_keys.iter().any(|k| k == pubkey) {
            return true;
        }
        if query.priority_only {
            return false;
        }

        if query.connected_pubkeys.iter().any(|k| k == pubkey) {
            // Another instance sharing the key of a connected peer
            return matches!(query.target_instance, Some(target) if is_new_instance(target));
        }

        if query.count < query.max {
            return true;
        }

        if query.connected_pubkeys.iter().any(|k| k == &self.own_pubkey) {
            return true;
        }

        let level = self.key_priority_level(pubkey, query.priority_keys).await;
        if level < MEMBER_KEY_LEVEL {
            return false;
        }
        for connected in query.connected_pubkeys {
            if self.key_priority_level(connected, query.priority_keys).await < level {
                return true;
            }
        }
        false
    }
}

pub(crate) fn short(pubkey: &str) -> &str {
    pubkey.get(..8).unwrap_or(pubkey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use std::time::Duration;

    const OWN: &str = "6G9VuAbBXqyDxyu7Da2z5Mm8r2wE9vFxGDhLKoDTSDKY";
    const MEMBER: &str = "HgTTJLAQ5sqfknMq7yLPZbehtuLSsKj9CxWN7k8QvYJd";
    const OTHER_MEMBER: &str = "2ny7YAdmzReQxAayyJZsyVYwYhVyax2thKcGknmQy5nQ";
    const STRANGER: &str = "D9D2zaJoWYWveii1JRYLVK3J4Z7ZH3QczoKrnQeiM6mx";
    const OTHER_STRANGER: &str = "5cnvo5bmR8QbtyNVnkDXWq6n5My6oNLd1o6auJApGCsv";

    async fn admission() -> (Admission, Arc<BanList>) {
        let chain = MemoryChain::new();
        chain.add_member(MEMBER).await;
        chain.add_member(OTHER_MEMBER).await;
        let bans = Arc::new(BanList::new(Duration::from_secs(120)));
        (
            Admission::new(OWN, "0000000a", Arc::new(chain), bans.clone()),
            bans,
        )
    }

    fn query<'a>(pubkey: &'a str, connected: &'a [String], priority: &'a [String]) -> AdmissionQuery<'a> {
        AdmissionQuery {
            pubkey,
            connected_pubkeys: connected,
            connected_instances: &[],
            count: connected.len(),
            max: 2,
            priority_keys: priority,
            priority_only: false,
            target_instance: None,
        }
    }

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn test_priority_levels() {
        let (admission, _) = admission().await;
        let prefered = keys(&[STRANGER]);
        assert_eq!(admission.key_priority_level(OTHER_STRANGER, &prefered).await, 0);
        assert_eq!(admission.key_priority_level(MEMBER, &prefered).await, 1);
        assert_eq!(admission.key_priority_level(STRANGER, &prefered).await, 2);
        assert_eq!(admission.key_priority_level(OWN, &prefered).await, 4);
    }

    #[tokio::test]
    async fn test_room_accepts_anyone() {
        let (admission, _) = admission().await;
        assert!(admission.accept_pubkey(query(STRANGER, &[], &[])).await);
    }

    #[tokio::test]
    async fn test_priority_key_accepted_at_capacity() {
        let (admission, _) = admission().await;
        let connected = keys(&[MEMBER, OTHER_MEMBER]);
        let prefered = keys(&[STRANGER]);
        assert!(!admission.accept_pubkey(query(STRANGER, &connected, &[])).await);
        assert!(admission.accept_pubkey(query(STRANGER, &connected, &prefered)).await);
    }

    #[tokio::test]
    async fn test_banned_key_never_accepted() {
        let (admission, bans) = admission().await;
        bans.ban(STRANGER, "invalid documents").await;
        let prefered = keys(&[STRANGER]);
        assert!(!admission.accept_pubkey(query(STRANGER, &[], &prefered)).await);
    }

    #[tokio::test]
    async fn test_member_displaces_non_member_only() {
        let (admission, _) = admission().await;
        let mixed = keys(&[OTHER_MEMBER, STRANGER]);
        assert!(admission.accept_pubkey(query(MEMBER, &mixed, &[])).await);
        assert!(!admission.accept_pubkey(query(OTHER_STRANGER, &mixed, &[])).await);

        let members_only = keys(&[OTHER_MEMBER, OWN]);
        let mut full = query(MEMBER, &members_only, &[]);
        full.count = 2;
        // Our own key is connected: that slot is evictable
        assert!(admission.accept_pubkey(full).await);

        let members_only = keys(&[OTHER_MEMBER, OTHER_MEMBER]);
        assert!(!admission.accept_pubkey(query(MEMBER, &members_only, &[])).await);
    }

    #[tokio::test]
    async fn test_priority_only_mode() {
        let (admission, _) = admission().await;
        let prefered = keys(&[STRANGER]);
        let mut q = query(MEMBER, &[], &prefered);
        q.priority_only = true;
        assert!(!admission.accept_pubkey(q).await);
        q.pubkey = STRANGER;
        assert!(admission.accept_pubkey(q).await);
        q.pubkey = OWN;
        assert!(admission.accept_pubkey(q).await);
    }

    #[tokio::test]
    async fn test_already_connected_key() {
        let (admission, _) = admission().await;
        let connected = keys(&[STRANGER]);
        let instances = keys(&["0000000b"]);
        let mut q = query(STRANGER, &connected, &[]);
        q.connected_instances = &instances;
        assert!(!admission.accept_pubkey(q).await);

        q.target_instance = Some("0000000b");
        assert!(!admission.accept_pubkey(q).await);
        q.target_instance = Some("0000000c");
        assert!(admission.accept_pubkey(q).await);
    }

    #[tokio::test]
    async fn test_own_key_instances() {
        let (admission, _) = admission().await;
        let instances = keys(&["0000000b"]);
        let mut q = query(OWN, &[], &[]);
        q.connected_instances = &instances;
        assert!(admission.accept_pubkey(q).await);

        q.target_instance = Some("0000000a");
        assert!(!admission.accept_pubkey(q).await);
        q.target_instance = Some(NULL_INSTANCE_ID);
        assert!(!admission.accept_pubkey(q).await);
        q.target_instance = Some("0000000b");
        assert!(!admission.accept_pubkey(q).await);
        q.target_instance = Some("0000000c");
        assert!(admission.accept_pubkey(q).await);
    }
}

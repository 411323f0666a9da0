//! Bans and offense tracking.
//!
//! A peer that keeps resubmitting the same invalid document is banned for a
//! fixed duration. Offenses are kept per document hash and forgotten once the
//! recall window has elapsed; bans expire on their own.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct BanRecord {
    reason: String,
    until: Instant,
}

/// Keys currently refused at admission
#[derive(Debug)]
pub struct BanList {
    bans: RwLock<HashMap<String, BanRecord>>,
    duration: Duration,
}

impl BanList {
    /// Create a ban list whose bans last `duration`
    pub fn new(duration: Duration) -> Self {
        Self {
            bans: RwLock::new(HashMap::new()),
            duration,
        }
    }

    /// Ban `pubkey`; an existing ban is extended
    pub async fn ban(&self, pubkey: &str, reason: &str) {
        let until = Instant::now() + self.duration;
        self.bans.write().await.insert(
            pubkey.to_string(),
            BanRecord {
                reason: reason.to_string(),
                until,
            },
        );
    }

    /// Reason of the running ban of `pubkey`, if any
    pub async fn ban_reason(&self, pubkey: &str) -> Option<String> {
        let now = Instant::now();
        {
            let bans = self.bans.read().await;
            match bans.get(pubkey) {
                None => return None,
                Some(record) if record.until > now => return Some(record.reason.clone()),
                Some(_) => {}
            }
        }
        self.bans.write().await.remove(pubkey);
        info!("Ban of {} has expired", pubkey);
        None
    }

    /// Whether `pubkey` is currently banned
    pub async fn is_banned(&self, pubkey: &str) -> bool {
        self.ban_reason(pubkey).await.is_some()
    }

    /// Lift the ban of `pubkey`
    pub async fn unban(&self, pubkey: &str) -> bool {
        self.bans.write().await.remove(pubkey).is_some()
    }

    /// Currently banned keys
    pub async fn banned(&self) -> Vec<String> {
        let now = Instant::now();
        self.bans
            .read()
            .await
            .iter()
            .filter(|(_, r)| r.until > now)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Drop expired bans
    pub async fn sweep(&self) {
        let now = Instant::now();
        self.bans.write().await.retain(|pubkey, record| {
            let alive = record.until > now;
            if !alive {
                debug!("Ban of {} has expired", pubkey);
            }
            alive
        });
    }
}

#[derive(Debug, Clone)]
struct OffenseRecord {
    created_at: Instant,
    offenders: HashMap<String, Vec<String>>,
}

/// Invalid documents per hash, with the keys that sent them
#[derive(Debug)]
pub struct OffenseLog {
    records: RwLock<HashMap<String, OffenseRecord>>,
    threshold: u32,
    recall: Duration,
}

impl OffenseLog {
    /// Create a log banning after `threshold` resubmissions within `recall`
    pub fn new(threshold: u32, recall: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            threshold,
            recall,
        }
    }

    /// Record that `pubkey` sent the invalid document `document_hash`.
    ///
    /// Returns true once the key reached the ban threshold for that document.
    pub async fn record(&self, document_hash: &str, pubkey: &str, reason: &str) -> bool {
        let now = Instant::now();
        let mut records = self.records.write().await;
        let record = records
            .entry(document_hash.to_string())
            .or_insert_with(|| OffenseRecord {
                created_at: now,
                offenders: HashMap::new(),
            });
        if now.duration_since(record.created_at) >= self.recall {
            record.created_at = now;
            record.offenders.clear();
        }

        let history = record.offenders.entry(pubkey.to_string()).or_default();
        history.push(reason.to_string());
        let count = history.len() as u32;
        if count >= self.threshold {
            record.offenders.remove(pubkey);
            warn!(
                "{} sent invalid document {} {} times, last error: {}",
                pubkey, document_hash, count, reason
            );
            return true;
        }
        warn!(
            "{} sent invalid document {} ({} of {}): {:?}",
            pubkey, document_hash, count, self.threshold, history
        );
        false
    }

    /// Number of offenses of `pubkey` for `document_hash` within the window
    pub async fn count(&self, document_hash: &str, pubkey: &str) -> u32 {
        let now = Instant::now();
        self.records
            .read()
            .await
            .get(document_hash)
            .filter(|r| now.duration_since(r.created_at) < self.recall)
            .and_then(|r| r.offenders.get(pubkey))
            .map(|h| h.len() as u32)
            .unwrap_or(0)
    }

    /// Forget records older than the recall window
    pub async fn sweep(&self) {
        let now = Instant::now();
        self.records
            .write()
            .await
            .retain(|_, r| now.duration_since(r.created_at) < self.recall);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ban_expires() {
        let bans = BanList::new(Duration::from_secs(120));
        bans.ban("alice", "spam").await;
        assert_eq!(bans.ban_reason("alice").await.as_deref(), Some("spam"));
        assert!(!bans.is_banned("bob").await);

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(bans.is_banned("alice").await);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!bans.is_banned("alice").await);
        assert!(bans.banned().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired_bans() {
        let bans = BanList::new(Duration::from_secs(10));
        bans.ban("alice", "spam").await;
        tokio::time::advance(Duration::from_secs(5)).await;
        bans.ban("bob", "spam").await;
        tokio::time::advance(Duration::from_secs(6)).await;
        bans.sweep().await;
        assert_eq!(bans.banned().await, vec!["bob".to_string()]);
        assert!(bans.unban("bob").await);
        assert!(!bans.is_banned("bob").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_triggers_ban() {
        let log = OffenseLog::new(5, Duration::from_secs(60));
        for _ in 0..4 {
            assert!(!log.record("H", "alice", "bad signature").await);
        }
        assert_eq!(log.count("H", "alice").await, 4);
        assert_eq!(log.count("H", "bob").await, 0);
        assert!(log.record("H", "alice", "bad signature").await);
        assert_eq!(log.count("H", "alice").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offenses_are_per_key_and_document() {
        let log = OffenseLog::new(2, Duration::from_secs(60));
        assert!(!log.record("H1", "alice", "e").await);
        assert!(!log.record("H2", "alice", "e").await);
        assert!(!log.record("H1", "bob", "e").await);
        assert!(log.record("H1", "alice", "e").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offenses_are_forgotten_after_recall() {
        let log = OffenseLog::new(2, Duration::from_secs(60));
        assert!(!log.record("H", "alice", "e").await);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(log.count("H", "alice").await, 0);
        assert!(!log.record("H", "alice", "e").await);

        tokio::time::advance(Duration::from_secs(61)).await;
        log.sweep().await;
        assert!(log.records.read().await.is_empty());
    }
}

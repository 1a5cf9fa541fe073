//! Enqueue-time suppression of re-delivered events.
//!
//! Platform clients routinely deliver the same gift or comment twice after a
//! reconnect. Each accepted event is reduced to an [`EventSignature`] and
//! remembered for the configured TTL.
//!
//! ## Housekeeping
//!
//! The store is bounded by two independent passes, both run inside `seen`:
//!
//! 1. Above `sweep_threshold` entries, every record whose expiry has passed
//!    is removed.
//! 2. Above `hard_cap` entries, the records closest to expiry are evicted
//!    until `trim_target` remain, expired or not.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use crate::config::DedupConfig;
use crate::event::EventKind;

/// Fixed-length digest of `(kind, actor, content…)`. Equality only.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventSignature([u8; 32]);

impl EventSignature {
    pub fn new(kind: EventKind, actor_id: &str, parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(actor_id.as_bytes());
        for part in parts {
            hasher.update(b"|");
            hasher.update(part.as_bytes());
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest[..32]);
        Self(bytes)
    }
}

impl fmt::Debug for EventSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventSignature(")?;
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "…)")
    }
}

/// TTL-bounded set of recently seen signatures.
pub struct EventDeduper {
    config: DedupConfig,
    /// signature → expiry
    store: Mutex<HashMap<EventSignature, Instant>>,
}

impl EventDeduper {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            store: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `false` the first time a signature is offered within its
    /// retention period (and records it), `true` for every repeat.
    ///
    /// A record whose expiry has passed counts as new again even if no
    /// housekeeping pass has removed it yet.
    pub fn seen(&self, signature: EventSignature) -> bool {
        let now = Instant::now();
        let mut store = self.store.lock();

        if store.len() > self.config.sweep_threshold {
            let before = store.len();
            store.retain(|_, expiry| *expiry >= now);
            debug!(removed = before - store.len(), "dedup sweep");
        }

        if let Some(expiry) = store.get(&signature) {
            if *expiry >= now {
                return true;
            }
        }

        store.insert(signature, now + self.config.ttl());

        if store.len() > self.config.hard_cap {
            let excess = store.len() - self.config.trim_target;
            let mut by_expiry: Vec<(EventSignature, Instant)> =
                store.iter().map(|(k, v)| (*k, *v)).collect();
            by_expiry.sort_by_key(|(_, expiry)| *expiry);
            for (sig, _) in by_expiry.into_iter().take(excess) {
                store.remove(&sig);
            }
            debug!(evicted = excess, "dedup hard cap eviction");
        }

        false
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sig(n: usize) -> EventSignature {
        EventSignature::new(EventKind::Comment, "u1", &[&n.to_string()])
    }

    fn deduper(ttl_secs: u64, sweep: usize, cap: usize, target: usize) -> EventDeduper {
        EventDeduper::new(DedupConfig {
            ttl_secs,
            sweep_threshold: sweep,
            hard_cap: cap,
            trim_target: target,
        })
    }

    #[test]
    fn signature_is_stable_and_content_sensitive() {
        let a = EventSignature::new(EventKind::Comment, "user1", &["hello"]);
        let b = EventSignature::new(EventKind::Comment, "user1", &["hello"]);
        let c = EventSignature::new(EventKind::Comment, "user1", &["different"]);
        let d = EventSignature::new(EventKind::Gift, "user1", &["hello"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn part_boundaries_matter() {
        let a = EventSignature::new(EventKind::Gift, "u1", &["ab", "c"]);
        let b = EventSignature::new(EventKind::Gift, "u1", &["a", "bc"]);
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn first_call_is_new_repeat_is_seen() {
        let d = deduper(10, 1_000, 5_000, 4_000);
        assert!(!d.seen(sig(1)));
        assert!(d.seen(sig(1)));
        assert!(!d.seen(sig(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_signature_is_new_again() {
        let d = deduper(1, 1_000, 5_000, 4_000);
        assert!(!d.seen(sig(1)));
        assert!(d.seen(sig(1)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!d.seen(sig(1)));
        assert!(d.seen(sig(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_cap_trims_to_target() {
        let d = deduper(600, 5, 5, 3);
        for n in 0..5 {
            assert!(!d.seen(sig(n)));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(d.len(), 5);

        // Sixth entry crosses the cap: trimmed down to the target.
        assert!(!d.seen(sig(5)));
        assert_eq!(d.len(), 3);

        // The oldest entries were evicted even though none had expired.
        assert!(!d.seen(sig(0)));
        // The newest survived.
        assert!(d.seen(sig(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired_entries() {
        let d = deduper(1, 2, 100, 50);
        assert!(!d.seen(sig(1)));
        assert!(!d.seen(sig(2)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!d.seen(sig(3)));
        // Store held 3 > threshold on this call: the two expired records were swept.
        assert!(!d.seen(sig(4)));
        assert!(d.seen(sig(4)));
        assert_eq!(d.len(), 2);
    }
}

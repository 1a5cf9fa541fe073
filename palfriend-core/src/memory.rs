//! Memory Store boundary: per-viewer state that outlives the session.
//!
//! The pipeline only needs the greeting cooldown timestamp; `remember_event`
//! lets a persistent backend keep interaction counters. Timestamps are wall
//! clock (`chrono::Utc`) since they are compared across restarts.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::Result;
use crate::event::EventKind;

#[async_trait]
pub trait MemoryStore: Send + Sync + 'static {
    /// Last time the viewer was greeted, if ever.
    async fn get_viewer_cooldown(&self, viewer_id: &str) -> Result<Option<DateTime<Utc>>>;

    async fn set_viewer_cooldown(&self, viewer_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Record an interaction. Backends without counters ignore it.
    async fn remember_event(
        &self,
        _viewer_id: &str,
        _nickname: &str,
        _kind: EventKind,
        _count: u32,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ViewerRecord {
    pub nickname: String,
    pub greeted_at: Option<DateTime<Utc>>,
    pub events: HashMap<EventKind, u64>,
}

/// Process-local store, used in tests and when no database is configured.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    viewers: Mutex<HashMap<String, ViewerRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, viewer_id: &str) -> Option<ViewerRecord> {
        self.viewers.lock().get(viewer_id).cloned()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn get_viewer_cooldown(&self, viewer_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .viewers
            .lock()
            .get(viewer_id)
            .and_then(|r| r.greeted_at))
    }

    async fn set_viewer_cooldown(&self, viewer_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.viewers
            .lock()
            .entry(viewer_id.to_string())
            .or_default()
            .greeted_at = Some(at);
        Ok(())
    }

    async fn remember_event(
        &self,
        viewer_id: &str,
        nickname: &str,
        kind: EventKind,
        count: u32,
    ) -> Result<()> {
        let mut viewers = self.viewers.lock();
        let record = viewers.entry(viewer_id.to_string()).or_default();
        if !nickname.is_empty() {
            record.nickname = nickname.to_string();
        }
        *record.events.entry(kind).or_insert(0) += u64::from(count.max(1));
        Ok(())
    }
}

/// True when `last` is unset or at least `cooldown` before `now`.
pub fn cooldown_elapsed(
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: std::time::Duration,
) -> bool {
    match last {
        None => true,
        Some(last) => match chrono::Duration::from_std(cooldown) {
            Ok(cooldown) => now - last >= cooldown,
            Err(_) => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cooldown_round_trips() {
        let store = InMemoryStore::new();
        assert!(store.get_viewer_cooldown("u1").await.expect("get").is_none());
        let now = Utc::now();
        store.set_viewer_cooldown("u1", now).await.expect("set");
        assert_eq!(store.get_viewer_cooldown("u1").await.expect("get"), Some(now));
    }

    #[tokio::test]
    async fn remember_event_counts_per_kind() {
        let store = InMemoryStore::new();
        store
            .remember_event("u1", "Ann", EventKind::Gift, 3)
            .await
            .expect("remember");
        store
            .remember_event("u1", "", EventKind::Gift, 2)
            .await
            .expect("remember");
        store
            .remember_event("u1", "", EventKind::Follow, 0)
            .await
            .expect("remember");
        let record = store.record("u1").expect("record");
        assert_eq!(record.nickname, "Ann");
        assert_eq!(record.events.get(&EventKind::Gift), Some(&5));
        assert_eq!(record.events.get(&EventKind::Follow), Some(&1));
    }

    #[test]
    fn cooldown_elapsed_boundaries() {
        let now = Utc::now();
        let cd = Duration::from_secs(360);
        assert!(cooldown_elapsed(None, now, cd));
        assert!(!cooldown_elapsed(Some(now - chrono::Duration::seconds(10)), now, cd));
        assert!(cooldown_elapsed(Some(now - chrono::Duration::seconds(360)), now, cd));
    }
}

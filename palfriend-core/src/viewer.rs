//! Live viewer table keyed by actor id.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub id: String,
    pub display_name: String,
    pub joined_at: Instant,
    pub last_active_at: Instant,
    pub greeted: bool,
}

/// In-memory record of everyone seen during this session.
#[derive(Debug, Default)]
pub struct ViewerTable {
    viewers: Mutex<HashMap<String, Viewer>>,
}

impl ViewerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the viewer on first sighting, otherwise refresh its activity
    /// timestamp (and nickname, when one is given). Returns a snapshot.
    pub fn touch(&self, id: &str, display_name: &str) -> Viewer {
        let now = Instant::now();
        let mut viewers = self.viewers.lock();
        let viewer = viewers.entry(id.to_string()).or_insert_with(|| Viewer {
            id: id.to_string(),
            display_name: if display_name.is_empty() {
                id.to_string()
            } else {
                display_name.to_string()
            },
            joined_at: now,
            last_active_at: now,
            greeted: false,
        });
        if !display_name.is_empty() {
            viewer.display_name = display_name.to_string();
        }
        viewer.last_active_at = now;
        viewer.clone()
    }

    pub fn get(&self, id: &str) -> Option<Viewer> {
        self.viewers.lock().get(id).cloned()
    }

    /// Active within `freshness` of now.
    pub fn is_present(&self, id: &str, freshness: Duration) -> bool {
        self.viewers
            .lock()
            .get(id)
            .map(|v| v.last_active_at.elapsed() <= freshness)
            .unwrap_or(false)
    }

    /// Flag the viewer as greeted. Returns `false` when unknown or already greeted.
    pub fn mark_greeted(&self, id: &str) -> bool {
        match self.viewers.lock().get_mut(id) {
            Some(v) if !v.greeted => {
                v.greeted = true;
                true
            }
            _ => false,
        }
    }

    /// Drop viewers idle for longer than `max_idle`, except ids in `keep`.
    pub fn prune_idle(&self, max_idle: Duration, keep: impl Fn(&str) -> bool) -> usize {
        let mut viewers = self.viewers.lock();
        let before = viewers.len();
        viewers.retain(|id, v| keep(id) || v.last_active_at.elapsed() <= max_idle);
        before - viewers.len()
    }

    pub fn len(&self) -> usize {
        self.viewers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

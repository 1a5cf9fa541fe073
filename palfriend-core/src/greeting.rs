//! Greeting scheduler and arrival announcer.
//!
//! A join schedules at most one deferred greet task per viewer. The task does
//! not speak; it only moves the viewer's name into the pending-announcement
//! list. The announcer drains that list into the outbox as one line once the
//! room has been quiet long enough.
//!
//! ```text
//! join ─► schedule(id) ─► sleep(delay) ─► checks ─► mark greeted
//!                                                   set cooldown
//!                                                   pending.push(name)
//! announcer tick ─► quiet? idle since output? global cooldown?
//!                 ─► batcher.add("Neu dabei: a, b, c")
//! ```

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::GreetingConfig;
use crate::diagnostics::PipelineDiagnostics;
use crate::error::Result;
use crate::memory::{cooldown_elapsed, MemoryStore};
use crate::outbox::OutboxBatcher;
use crate::sender::OutputClock;
use crate::speech::ActivityGates;
use crate::viewer::ViewerTable;

/// Why a greet task ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreetOutcome {
    Queued,
    Gone,
    AlreadyGreeted,
    Cooldown,
    Absent,
}

pub struct GreetingScheduler {
    config: GreetingConfig,
    viewers: Arc<ViewerTable>,
    memory: Arc<dyn MemoryStore>,
    batcher: Arc<OutboxBatcher>,
    gates: ActivityGates,
    clock: Arc<OutputClock>,
    diagnostics: Arc<PipelineDiagnostics>,
    /// Viewer ids with a live greet task.
    tasks: Mutex<HashSet<String>>,
    pending: Mutex<Vec<String>>,
    last_announce: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

/// Removes the task entry however the task ends.
struct TaskGuard {
    scheduler: Arc<GreetingScheduler>,
    viewer_id: String,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.scheduler.tasks.lock().remove(&self.viewer_id);
    }
}

impl GreetingScheduler {
    pub fn new(
        config: GreetingConfig,
        viewers: Arc<ViewerTable>,
        memory: Arc<dyn MemoryStore>,
        batcher: Arc<OutboxBatcher>,
        gates: ActivityGates,
        clock: Arc<OutputClock>,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Self {
        Self {
            config,
            viewers,
            memory,
            batcher,
            gates,
            clock,
            diagnostics,
            tasks: Mutex::new(HashSet::new()),
            pending: Mutex::new(Vec::new()),
            last_announce: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn a greet task for `viewer_id` unless one is already pending.
    /// Returns whether a task was created.
    pub fn schedule(self: &Arc<Self>, viewer_id: &str) -> bool {
        if !self.config.enabled || viewer_id.is_empty() {
            return false;
        }
        if !self.tasks.lock().insert(viewer_id.to_string()) {
            debug!(viewer_id, "greet task already pending");
            return false;
        }
        self.diagnostics
            .greetings_scheduled
            .fetch_add(1, Ordering::Relaxed);

        let guard = TaskGuard {
            scheduler: Arc::clone(self),
            viewer_id: viewer_id.to_string(),
        };
        let span = info_span!("greet", viewer_id = %viewer_id);
        tokio::spawn(
            async move {
                let this = Arc::clone(&guard.scheduler);
                tokio::select! {
                    _ = this.cancel.cancelled() => debug!("greet task cancelled"),
                    result = this.greet(&guard.viewer_id) => match result {
                        Ok(outcome) => debug!(?outcome, "greet task finished"),
                        Err(e) => error!("greet task failed: {e}"),
                    },
                }
                drop(guard);
            }
            .instrument(span),
        );
        true
    }

    async fn greet(&self, viewer_id: &str) -> Result<GreetOutcome> {
        tokio::time::sleep(self.config.delay()).await;

        let Some(viewer) = self.viewers.get(viewer_id) else {
            return Ok(GreetOutcome::Gone);
        };
        if viewer.greeted {
            return Ok(GreetOutcome::AlreadyGreeted);
        }
        let last = self.memory.get_viewer_cooldown(viewer_id).await?;
        if !cooldown_elapsed(last, Utc::now(), self.config.cooldown()) {
            return Ok(GreetOutcome::Cooldown);
        }
        if !self.viewers.is_present(viewer_id, self.config.presence()) {
            return Ok(GreetOutcome::Absent);
        }
        if !self.viewers.mark_greeted(viewer_id) {
            return Ok(GreetOutcome::AlreadyGreeted);
        }
        self.memory
            .set_viewer_cooldown(viewer_id, Utc::now())
            .await?;

        let mut pending = self.pending.lock();
        if !pending.contains(&viewer.display_name) {
            pending.push(viewer.display_name);
        }
        Ok(GreetOutcome::Queued)
    }

    /// One announcer iteration. Returns whether an announcement was added.
    pub async fn announce_tick(&self) -> Result<bool> {
        self.viewers
            .prune_idle(self.config.viewer_idle_prune(), |id| {
                self.tasks.lock().contains(id)
            });

        if !self.gates.is_quiet() || self.pending.lock().is_empty() {
            return Ok(false);
        }
        if !self.clock.idle_for(self.config.min_idle_since_output()) {
            return Ok(false);
        }
        if let Some(last) = *self.last_announce.lock() {
            if last.elapsed() < self.config.global_cooldown() {
                return Ok(false);
            }
        }

        let names: Vec<String> = {
            let mut pending = self.pending.lock();
            let n = self.config.announce_batch.min(pending.len());
            pending.drain(..n).collect()
        };
        *self.last_announce.lock() = Some(Instant::now());

        let count = names.len();
        let line = format!("{}{}", self.config.announce_prefix, names.join(", "));
        if let Err(e) = self
            .batcher
            .add(&line, self.config.announce_priority, None)
            .await
        {
            let mut pending = self.pending.lock();
            pending.splice(0..0, names);
            return Err(e);
        }
        self.diagnostics
            .greetings_announced
            .fetch_add(count, Ordering::Relaxed);
        info!(count, line = %line, "arrivals announced");
        Ok(true)
    }

    pub async fn run_announcer(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.announcer_tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.announce_tick().await {
                        warn!("announcement failed: {e}");
                    }
                }
            }
        }
        self.cancel.cancel();
        debug!("announcer stopped");
    }

    /// Abort every pending greet task.
    pub fn cancel_pending(&self) {
        self.cancel.cancel();
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn has_pending_task(&self, viewer_id: &str) -> bool {
        self.tasks.lock().contains(viewer_id)
    }

    pub fn pending_names(&self) -> Vec<String> {
        self.pending.lock().clone()
    }
}

//! Event intake: validation, enqueue-time dedup and per-kind bounded queues.
//!
//! | Kind | Signature parts | Extra |
//! |------|-----------------|-------|
//! | comment | lower-cased text | length + ignore rules, touches viewer |
//! | gift | gift name, repeat count | |
//! | like | none, never deduplicated | |
//! | join | actor only | touches viewer |
//! | follow | actor only | global follow cooldown, checked before dedup |
//! | share / subscribe | actor only | |
//!
//! `ingest` never blocks: a full queue drops the newest event.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::classify::CommentClassifier;
use crate::config::{CommentConfig, CompanionConfig, EventConfig};
use crate::dedup::{EventDeduper, EventSignature};
use crate::diagnostics::PipelineDiagnostics;
use crate::event::{EventKind, EventPayload, LiveEvent};
use crate::viewer::ViewerTable;

/// What happened to an ingested event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeOutcome {
    Queued,
    Duplicate,
    /// Missing actor id.
    Malformed,
    /// Comment too short, ignored by rule, or comments disabled.
    Filtered,
    /// Follow within the follow cooldown.
    Throttled,
    /// Queue full; the event was dropped.
    Overflow,
    /// Consumers have stopped.
    Closed,
}

/// Consumer ends of the per-kind queues.
#[derive(Debug)]
pub struct EventReceivers {
    pub comment: mpsc::Receiver<LiveEvent>,
    pub gift: mpsc::Receiver<LiveEvent>,
    pub like: mpsc::Receiver<LiveEvent>,
    pub join: mpsc::Receiver<LiveEvent>,
    pub follow: mpsc::Receiver<LiveEvent>,
    pub share: mpsc::Receiver<LiveEvent>,
    pub subscribe: mpsc::Receiver<LiveEvent>,
}

impl EventReceivers {
    /// Separate the comment queue from the fan-in kinds.
    pub fn split(self) -> (mpsc::Receiver<LiveEvent>, FanInReceivers) {
        (
            self.comment,
            FanInReceivers {
                gift: self.gift,
                like: self.like,
                join: self.join,
                follow: self.follow,
                share: self.share,
                subscribe: self.subscribe,
            },
        )
    }
}

/// Every queue except comments, drained by the fan-in dispatcher.
#[derive(Debug)]
pub struct FanInReceivers {
    pub gift: mpsc::Receiver<LiveEvent>,
    pub like: mpsc::Receiver<LiveEvent>,
    pub join: mpsc::Receiver<LiveEvent>,
    pub follow: mpsc::Receiver<LiveEvent>,
    pub share: mpsc::Receiver<LiveEvent>,
    pub subscribe: mpsc::Receiver<LiveEvent>,
}

#[derive(Debug, Clone)]
struct EventSenders {
    comment: mpsc::Sender<LiveEvent>,
    gift: mpsc::Sender<LiveEvent>,
    like: mpsc::Sender<LiveEvent>,
    join: mpsc::Sender<LiveEvent>,
    follow: mpsc::Sender<LiveEvent>,
    share: mpsc::Sender<LiveEvent>,
    subscribe: mpsc::Sender<LiveEvent>,
}

impl EventSenders {
    fn for_kind(&self, kind: EventKind) -> &mpsc::Sender<LiveEvent> {
        match kind {
            EventKind::Comment => &self.comment,
            EventKind::Gift => &self.gift,
            EventKind::Like => &self.like,
            EventKind::Join => &self.join,
            EventKind::Follow => &self.follow,
            EventKind::Share => &self.share,
            EventKind::Subscribe => &self.subscribe,
        }
    }
}

fn event_queues(capacity: usize) -> (EventSenders, EventReceivers) {
    let (comment_tx, comment) = mpsc::channel(capacity);
    let (gift_tx, gift) = mpsc::channel(capacity);
    let (like_tx, like) = mpsc::channel(capacity);
    let (join_tx, join) = mpsc::channel(capacity);
    let (follow_tx, follow) = mpsc::channel(capacity);
    let (share_tx, share) = mpsc::channel(capacity);
    let (subscribe_tx, subscribe) = mpsc::channel(capacity);
    (
        EventSenders {
            comment: comment_tx,
            gift: gift_tx,
            like: like_tx,
            join: join_tx,
            follow: follow_tx,
            share: share_tx,
            subscribe: subscribe_tx,
        },
        EventReceivers {
            comment,
            gift,
            like,
            join,
            follow,
            share,
            subscribe,
        },
    )
}

struct IntakeInner {
    events: EventConfig,
    comment: CommentConfig,
    classifier: CommentClassifier,
    dedup: EventDeduper,
    viewers: Arc<ViewerTable>,
    senders: EventSenders,
    last_follow: Mutex<Option<Instant>>,
    diagnostics: Arc<PipelineDiagnostics>,
}

/// Producer handle handed to the event source. Cheap to clone.
#[derive(Clone)]
pub struct EventIntake {
    inner: Arc<IntakeInner>,
}

impl EventIntake {
    pub fn new(
        config: &CompanionConfig,
        viewers: Arc<ViewerTable>,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> (Self, EventReceivers) {
        let (senders, receivers) = event_queues(config.events.queue_capacity);
        let inner = IntakeInner {
            events: config.events.clone(),
            comment: config.comment.clone(),
            classifier: CommentClassifier::new(&config.comment),
            dedup: EventDeduper::new(config.dedup.clone()),
            viewers,
            senders,
            last_follow: Mutex::new(None),
            diagnostics,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receivers,
        )
    }

    pub fn ingest(&self, event: LiveEvent) -> IntakeOutcome {
        let inner = &*self.inner;
        inner.diagnostics.events_in.fetch_add(1, Ordering::Relaxed);
        let outcome = inner.admit(event);
        if !matches!(outcome, IntakeOutcome::Queued) {
            inner.diagnostics.events_dropped.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    pub fn viewers(&self) -> &Arc<ViewerTable> {
        &self.inner.viewers
    }
}

impl IntakeInner {
    fn admit(&self, event: LiveEvent) -> IntakeOutcome {
        let actor_id = event.actor.id.trim().to_string();
        if actor_id.is_empty() {
            debug!(kind = %event.kind(), "event without actor id dropped");
            return IntakeOutcome::Malformed;
        }
        let kind = event.kind();

        let signature = match &event.payload {
            EventPayload::Comment { text } => {
                let text = text.trim();
                if !self.comment.enabled
                    || text.chars().count() < self.comment.min_length
                    || self.classifier.is_ignored(text)
                {
                    debug!(viewer_id = %actor_id, "comment filtered");
                    return IntakeOutcome::Filtered;
                }
                self.viewers.touch(&actor_id, event.actor.display_name());
                Some(EventSignature::new(
                    kind,
                    &actor_id,
                    &[text.to_lowercase().as_str()],
                ))
            }
            EventPayload::Gift {
                gift_name,
                repeat_count,
            } => Some(EventSignature::new(
                kind,
                &actor_id,
                &[gift_name.as_str(), repeat_count.to_string().as_str()],
            )),
            EventPayload::Like { .. } => None,
            EventPayload::Join => {
                self.viewers.touch(&actor_id, event.actor.display_name());
                Some(EventSignature::new(kind, &actor_id, &[]))
            }
            EventPayload::Follow | EventPayload::Share | EventPayload::Subscribe => {
                Some(EventSignature::new(kind, &actor_id, &[]))
            }
        };

        if kind == EventKind::Follow && !self.follow_allowed() {
            debug!(viewer_id = %actor_id, "follow throttled");
            return IntakeOutcome::Throttled;
        }

        if let Some(signature) = signature {
            if self.dedup.seen(signature) {
                self.diagnostics
                    .events_duplicate
                    .fetch_add(1, Ordering::Relaxed);
                debug!(kind = %kind, viewer_id = %actor_id, "duplicate event");
                return IntakeOutcome::Duplicate;
            }
        }

        match self.senders.for_kind(kind).try_send(event) {
            Ok(()) => IntakeOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                warn!(kind = %kind, "event queue full, dropping event");
                IntakeOutcome::Overflow
            }
            Err(TrySendError::Closed(_)) => IntakeOutcome::Closed,
        }
    }

    fn follow_allowed(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_follow.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.events.follow_cooldown() => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Actor;
    use std::time::Duration;

    fn intake(config: CompanionConfig) -> (EventIntake, EventReceivers) {
        EventIntake::new(
            &config,
            Arc::new(ViewerTable::new()),
            Arc::new(PipelineDiagnostics::default()),
        )
    }

    fn ann() -> Actor {
        Actor::new("u1", "Ann")
    }

    #[tokio::test]
    async fn missing_actor_is_malformed() {
        let (intake, _rx) = intake(CompanionConfig::default());
        let outcome = intake.ingest(LiveEvent::join(Actor::new("  ", "x")));
        assert_eq!(outcome, IntakeOutcome::Malformed);
    }

    #[tokio::test]
    async fn redelivered_gift_is_duplicate() {
        let (intake, mut rx) = intake(CompanionConfig::default());
        assert_eq!(intake.ingest(LiveEvent::gift(ann(), "Rose", 3)), IntakeOutcome::Queued);
        assert_eq!(intake.ingest(LiveEvent::gift(ann(), "Rose", 3)), IntakeOutcome::Duplicate);
        assert_eq!(intake.ingest(LiveEvent::gift(ann(), "Rose", 4)), IntakeOutcome::Queued);
        assert!(rx.gift.recv().await.is_some());
        assert!(rx.gift.recv().await.is_some());
        assert!(rx.gift.try_recv().is_err());
    }

    #[tokio::test]
    async fn comment_signature_ignores_case() {
        let (intake, _rx) = intake(CompanionConfig::default());
        assert_eq!(intake.ingest(LiveEvent::comment(ann(), "Hello there")), IntakeOutcome::Queued);
        assert_eq!(intake.ingest(LiveEvent::comment(ann(), "hello THERE ")), IntakeOutcome::Duplicate);
    }

    #[tokio::test]
    async fn likes_are_never_deduplicated() {
        let (intake, mut rx) = intake(CompanionConfig::default());
        for _ in 0..3 {
            assert_eq!(intake.ingest(LiveEvent::like(ann(), 5)), IntakeOutcome::Queued);
        }
        for _ in 0..3 {
            assert!(rx.like.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn short_and_ignored_comments_are_filtered() {
        let (intake, _rx) = intake(CompanionConfig::default());
        assert_eq!(intake.ingest(LiveEvent::comment(ann(), "ok")), IntakeOutcome::Filtered);
        assert_eq!(intake.ingest(LiveEvent::comment(ann(), "!points")), IntakeOutcome::Filtered);
        assert_eq!(
            intake.ingest(LiveEvent::comment(ann(), "see https://x.y")),
            IntakeOutcome::Filtered
        );
        assert!(intake.viewers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn follows_are_throttled_globally() {
        let (intake, _rx) = intake(CompanionConfig::default());
        let follow = |id: &str| LiveEvent::new(Actor::new(id, ""), EventPayload::Follow);
        assert_eq!(intake.ingest(follow("a")), IntakeOutcome::Queued);
        assert_eq!(intake.ingest(follow("b")), IntakeOutcome::Throttled);
        tokio::time::advance(Duration::from_secs(6)).await;
        // Throttled follows leave no signature behind.
        assert_eq!(intake.ingest(follow("b")), IntakeOutcome::Queued);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(intake.ingest(follow("a")), IntakeOutcome::Duplicate);
    }

    #[tokio::test]
    async fn full_queue_overflows() {
        let mut config = CompanionConfig::default();
        config.events.queue_capacity = 1;
        let (intake, _rx) = intake(config);
        assert_eq!(intake.ingest(LiveEvent::like(ann(), 1)), IntakeOutcome::Queued);
        assert_eq!(intake.ingest(LiveEvent::like(ann(), 1)), IntakeOutcome::Overflow);
    }

    #[tokio::test]
    async fn dropped_receivers_report_closed() {
        let (intake, rx) = intake(CompanionConfig::default());
        drop(rx);
        assert_eq!(intake.ingest(LiveEvent::like(ann(), 1)), IntakeOutcome::Closed);
    }

    #[tokio::test]
    async fn join_and_comment_touch_viewers() {
        let (intake, _rx) = intake(CompanionConfig::default());
        intake.ingest(LiveEvent::join(ann()));
        intake.ingest(LiveEvent::comment(Actor::new("u2", ""), "good evening all"));
        intake.ingest(LiveEvent::gift(Actor::new("u3", "Cy"), "Rose", 1));
        let viewers = intake.viewers();
        assert_eq!(viewers.get("u1").map(|v| v.display_name), Some("Ann".to_string()));
        assert_eq!(viewers.get("u2").map(|v| v.display_name), Some("u2".to_string()));
        assert!(viewers.get("u3").is_none());
    }
}

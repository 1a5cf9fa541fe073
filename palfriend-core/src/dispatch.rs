//! Queue consumers: the fan-in event dispatcher and the comment processor.
//!
//! The dispatcher multiplexes the gift/like/join/follow/share/subscribe
//! queues with `select!` (random branch order, so no kind starves) plus a
//! timeout branch. Comments have their own consumer because replying
//! involves cooldowns, the rate limiter and the external responder.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classify::CommentClassifier;
use crate::config::{CommentConfig, CompanionConfig, EventConfig};
use crate::diagnostics::PipelineDiagnostics;
use crate::error::Result;
use crate::event::{EventKind, EventPayload, LiveEvent};
use crate::greeting::GreetingScheduler;
use crate::intake::FanInReceivers;
use crate::memory::{cooldown_elapsed, MemoryStore};
use crate::outbox::OutboxBatcher;
use crate::rate_limit::TokenBucket;

/// Pause before a comment deferred by the per-user cooldown is revisited.
const DEFER_DELAY: Duration = Duration::from_millis(50);

/// Reply generator for relevant comments (external collaborator).
#[async_trait]
pub trait Responder: Send + Sync + 'static {
    async fn reply(&self, nickname: &str, comment: &str) -> Result<Option<String>>;
}

/// Never replies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReply;

#[async_trait]
impl Responder for NoReply {
    async fn reply(&self, _nickname: &str, _comment: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// The spoken line for a non-comment event, if it deserves one.
pub fn event_line(event: &LiveEvent, like_threshold: u32) -> Option<String> {
    let nick = event.actor.display_name();
    match &event.payload {
        EventPayload::Gift {
            gift_name,
            repeat_count,
        } => Some(format!("{nick} sent {gift_name} x{repeat_count}")),
        EventPayload::Follow => Some(format!("{nick} followed")),
        EventPayload::Share => Some(format!("{nick} shared")),
        EventPayload::Subscribe => Some(format!("{nick} subscribed")),
        EventPayload::Like { count } if *count >= like_threshold => {
            Some(format!("{nick} liked x{count}"))
        }
        EventPayload::Like { .. } | EventPayload::Join | EventPayload::Comment { .. } => None,
    }
}

fn event_count(payload: &EventPayload) -> u32 {
    match payload {
        EventPayload::Gift { repeat_count, .. } => *repeat_count,
        EventPayload::Like { count } => *count,
        _ => 1,
    }
}

async fn remember(
    memory: &dyn MemoryStore,
    id: &str,
    nickname: &str,
    kind: EventKind,
    count: u32,
) {
    if let Err(e) = memory.remember_event(id, nickname, kind, count).await {
        warn!(viewer_id = %id, "remember_event failed: {e}");
    }
}

// ---------------------------------------------------------------------------
// Fan-in dispatcher
// ---------------------------------------------------------------------------

pub struct EventDispatcher {
    config: EventConfig,
    queues: FanInReceivers,
    batcher: Arc<OutboxBatcher>,
    greeter: Arc<GreetingScheduler>,
    memory: Arc<dyn MemoryStore>,
}

impl EventDispatcher {
    pub fn new(
        config: &CompanionConfig,
        queues: FanInReceivers,
        batcher: Arc<OutboxBatcher>,
        greeter: Arc<GreetingScheduler>,
        memory: Arc<dyn MemoryStore>,
    ) -> Self {
        Self {
            config: config.events.clone(),
            queues,
            batcher,
            greeter,
            memory,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let tick = self.config.fan_in_tick();
        loop {
            let q = &mut self.queues;
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(e) = q.gift.recv() => e,
                Some(e) = q.subscribe.recv() => e,
                Some(e) = q.follow.recv() => e,
                Some(e) = q.share.recv() => e,
                Some(e) = q.like.recv() => e,
                Some(e) = q.join.recv() => e,
                _ = tokio::time::sleep(tick) => continue,
            };
            if let Err(e) = self.handle(event).await {
                error!("event handling failed: {e}");
            }
        }
        debug!("dispatcher stopped");
    }

    async fn handle(&self, event: LiveEvent) -> Result<()> {
        let kind = event.kind();
        let actor = &event.actor;
        let minor_like = matches!(
            event.payload,
            EventPayload::Like { count } if count < self.config.like_threshold
        );
        if !minor_like {
            remember(
                self.memory.as_ref(),
                &actor.id,
                actor.display_name(),
                kind,
                event_count(&event.payload),
            )
            .await;
        }

        if kind == EventKind::Join {
            self.greeter.schedule(&actor.id);
            return Ok(());
        }

        if let Some(line) = event_line(&event, self.config.like_threshold) {
            info!(kind = %kind, viewer_id = %actor.id, "{line}");
            self.batcher
                .add(&line, self.config.priority_of(kind), Some(&actor.id))
                .await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Comment processor
// ---------------------------------------------------------------------------

pub struct CommentProcessor {
    config: CommentConfig,
    priority: i32,
    classifier: CommentClassifier,
    queue: mpsc::Receiver<LiveEvent>,
    /// Comments deferred by the per-user cooldown, at most `backlog_cap`.
    backlog: VecDeque<LiveEvent>,
    backlog_cap: usize,
    limiter: Arc<TokenBucket>,
    batcher: Arc<OutboxBatcher>,
    memory: Arc<dyn MemoryStore>,
    responder: Arc<dyn Responder>,
    diagnostics: Arc<PipelineDiagnostics>,
    next_allowed_global: Option<Instant>,
    per_user_until: HashMap<String, Instant>,
}

impl CommentProcessor {
    pub fn new(
        config: &CompanionConfig,
        queue: mpsc::Receiver<LiveEvent>,
        limiter: Arc<TokenBucket>,
        batcher: Arc<OutboxBatcher>,
        memory: Arc<dyn MemoryStore>,
        responder: Arc<dyn Responder>,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Self {
        Self {
            config: config.comment.clone(),
            priority: config.events.priority_of(EventKind::Comment),
            classifier: CommentClassifier::new(&config.comment),
            queue,
            backlog: VecDeque::new(),
            backlog_cap: config.events.queue_capacity.max(1),
            limiter,
            batcher,
            memory,
            responder,
            diagnostics,
            next_allowed_global: None,
            per_user_until: HashMap::new(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            // New arrivals go ahead of deferred comments.
            let (event, fresh) = match self.queue.try_recv() {
                Ok(event) => (event, true),
                Err(_) => match self.backlog.pop_front() {
                    Some(event) => (event, false),
                    None => tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = self.queue.recv() => match next {
                            Some(event) => (event, true),
                            None => break,
                        },
                    },
                },
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.handle(event, fresh) => {
                    if let Err(e) = result {
                        error!("comment processing failed: {e}");
                    }
                }
            }
        }
        debug!("comment processor stopped");
    }

    async fn handle(&mut self, event: LiveEvent, fresh: bool) -> Result<()> {
        if fresh {
            remember(
                self.memory.as_ref(),
                &event.actor.id,
                event.actor.display_name(),
                EventKind::Comment,
                1,
            )
            .await;
        }
        self.process(event).await
    }

    async fn process(&mut self, event: LiveEvent) -> Result<()> {
        let EventPayload::Comment { text } = &event.payload else {
            return Ok(());
        };
        let uid = event.actor.id.clone();
        let nick = event.actor.display_name().to_string();
        let text = text.trim().to_string();

        if let Some(until) = self.per_user_until.get(&uid) {
            if Instant::now() < *until {
                tokio::time::sleep(DEFER_DELAY).await;
                if self.backlog.len() >= self.backlog_cap {
                    warn!(viewer_id = %uid, "comment backlog full, dropping comment");
                    self.diagnostics
                        .events_dropped
                        .fetch_add(1, Ordering::Relaxed);
                } else {
                    self.backlog.push_back(event);
                }
                return Ok(());
            }
        }

        if self.config.respond_to_greetings
            && self.classifier.is_greeting(&text)
            && !text.contains('?')
            && text.split_whitespace().count() <= 4
        {
            let last = self.memory.get_viewer_cooldown(&uid).await?;
            let now = Utc::now();
            if cooldown_elapsed(last, now, self.config.greeting_cooldown()) {
                self.memory.set_viewer_cooldown(&uid, now).await?;
                self.pace().await;
                return self.emit(&uid, &format!("{nick} sagt hallo")).await;
            }
        }

        if self.config.respond_to_thanks && self.classifier.is_thanks(&text) {
            self.pace().await;
            return self.emit(&uid, &format!("{nick} bedankt sich")).await;
        }

        let score = self.classifier.score(&text);
        if score < self.config.reply_threshold {
            debug!(viewer_id = %uid, score, "comment below reply threshold");
            return Ok(());
        }

        self.pace().await;
        self.diagnostics
            .replies_requested
            .fetch_add(1, Ordering::Relaxed);
        match self.responder.reply(&nick, &text).await? {
            Some(reply) if !reply.trim().is_empty() => {
                self.emit(&uid, &format!("@{nick}: {text} → {}", reply.trim()))
                    .await
            }
            _ => {
                debug!(viewer_id = %uid, "responder returned nothing");
                Ok(())
            }
        }
    }

    /// Rate limiter token, then the global cooldown.
    async fn pace(&self) {
        self.limiter.take().await;
        if let Some(next) = self.next_allowed_global {
            if Instant::now() < next {
                tokio::time::sleep_until(next).await;
            }
        }
    }

    async fn emit(&mut self, uid: &str, line: &str) -> Result<()> {
        self.batcher.add(line, self.priority, Some(uid)).await?;
        let now = Instant::now();
        self.next_allowed_global = Some(now + self.config.global_cooldown());
        self.per_user_until.retain(|_, until| *until > now);
        self.per_user_until
            .insert(uid.to_string(), now + self.config.per_user_cooldown());
        Ok(())
    }
}

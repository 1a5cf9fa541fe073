//! Sender / output worker.
//!
//! ## Per-message turn
//!
//! ```text
//! 1. wait until Speech is Idle
//! 2. channel.send(text)
//!    ├─ Err → attempts += 1; drop if attempts == max_attempts,
//!    │        else back off and re-queue at the tail
//!    └─ Ok  → mark OutputClock
//!             optionally wait speech-start (bounded) then speech-end (bounded)
//!             post gap, mark OutputClock again, inter-message gap
//! 3. broadcast OutputEvent
//! ```
//!
//! This is the only consumer of the outbound queue, so messages reach the
//! channel strictly one at a time.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::OutputChannel;
use crate::config::{CompanionConfig, SenderConfig, SpeechConfig};
use crate::diagnostics::PipelineDiagnostics;
use crate::error::{PalfriendError, Result};
use crate::ipc::events::{OutputEvent, OutputOutcome};
use crate::outbox::FlushSink;
use crate::speech::SpeechState;

const ELLIPSIS: char = '…';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub text: String,
    /// Failed send attempts so far.
    pub attempts: u32,
}

/// Producer handle of the outbound queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    max_line_length: usize,
}

/// Consumer half, owned by the [`OutputWorker`].
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<OutboundMessage>,
    requeue: mpsc::UnboundedSender<OutboundMessage>,
}

pub fn outbound_queue(max_line_length: usize) -> (OutboundQueue, OutboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = OutboundQueue {
        tx: tx.clone(),
        max_line_length,
    };
    (queue, OutboundReceiver { rx, requeue: tx })
}

impl OutboundQueue {
    /// Trim and enqueue one line. Blank text is ignored.
    pub fn push(&self, text: &str) -> Result<()> {
        let line = trim_line(text, self.max_line_length);
        if line.is_empty() {
            return Ok(());
        }
        self.tx
            .send(OutboundMessage {
                text: line,
                attempts: 0,
            })
            .map_err(|_| PalfriendError::QueueClosed)
    }
}

#[async_trait]
impl FlushSink for OutboundQueue {
    async fn deliver(&self, payload: String) -> Result<()> {
        self.push(&payload)
    }
}

/// Collapse surrounding whitespace and cut to `max_chars`, ending in `…`
/// when shortened.
pub fn trim_line(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    let kept = out.trim_end().len();
    out.truncate(kept);
    out.push(ELLIPSIS);
    out
}

/// Timestamp of the most recent completed output.
#[derive(Debug, Default)]
pub struct OutputClock {
    last: Mutex<Option<Instant>>,
}

impl OutputClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        *self.last.lock() = Some(Instant::now());
    }

    pub fn last(&self) -> Option<Instant> {
        *self.last.lock()
    }

    /// True when nothing was emitted within `quiet`.
    pub fn idle_for(&self, quiet: Duration) -> bool {
        match self.last() {
            Some(at) => at.elapsed() >= quiet,
            None => true,
        }
    }
}

pub struct OutputWorker {
    sender: SenderConfig,
    speech_config: SpeechConfig,
    channel: Arc<dyn OutputChannel>,
    speech: Arc<SpeechState>,
    clock: Arc<OutputClock>,
    queue: OutboundReceiver,
    diagnostics: Arc<PipelineDiagnostics>,
    events: broadcast::Sender<OutputEvent>,
    seq: u64,
}

impl OutputWorker {
    pub fn new(
        config: &CompanionConfig,
        channel: Arc<dyn OutputChannel>,
        speech: Arc<SpeechState>,
        clock: Arc<OutputClock>,
        queue: OutboundReceiver,
        diagnostics: Arc<PipelineDiagnostics>,
        events: broadcast::Sender<OutputEvent>,
    ) -> Self {
        Self {
            sender: config.sender.clone(),
            speech_config: config.speech.clone(),
            channel,
            speech,
            clock,
            queue,
            diagnostics,
            events,
            seq: 0,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(channel = self.channel.name(), "sender started");
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.queue.rx.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.handle(message) => {}
            }
        }
        info!("sender stopped");
    }

    async fn handle(&mut self, mut message: OutboundMessage) {
        self.speech.wait_idle().await;

        match self.channel.send(&message.text).await {
            Ok(()) => {
                self.clock.mark();
                self.diagnostics.messages_sent.fetch_add(1, Ordering::Relaxed);
                info!(text = %message.text, "sent");
                self.emit(&message, OutputOutcome::Sent);
                self.finish_turn().await;
            }
            Err(e) => {
                message.attempts += 1;
                self.diagnostics.send_failures.fetch_add(1, Ordering::Relaxed);
                if message.attempts >= self.sender.max_attempts {
                    error!(
                        attempt = message.attempts,
                        text = %message.text,
                        "send failed, dropping message: {e}"
                    );
                    self.diagnostics
                        .messages_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    self.emit(&message, OutputOutcome::Dropped);
                    return;
                }
                let backoff = self.sender.backoff_for_attempt(message.attempts);
                warn!(
                    attempt = message.attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "send failed, retrying: {e}"
                );
                tokio::time::sleep(backoff).await;
                if self.queue.requeue.send(message).is_err() {
                    warn!("outbound queue closed while re-queueing");
                }
            }
        }
    }

    async fn finish_turn(&self) {
        let cfg = &self.speech_config;
        if cfg.await_signals {
            if self.speech.wait_started(cfg.wait_start_timeout()).await {
                if !self.speech.wait_ended(cfg.max_speech()).await {
                    warn!(
                        max_speech_ms = cfg.max_speech_ms,
                        "speech end not signalled, assuming idle"
                    );
                    self.speech.mark_ended();
                }
            } else {
                debug!("no speech-start signal within timeout");
            }
        }
        tokio::time::sleep(cfg.post_gap()).await;
        self.clock.mark();
        tokio::time::sleep(self.sender.inter_message_gap()).await;
    }

    fn emit(&mut self, message: &OutboundMessage, outcome: OutputOutcome) {
        self.seq += 1;
        let attempts = match outcome {
            OutputOutcome::Sent => message.attempts + 1,
            OutputOutcome::Dropped => message.attempts,
        };
        // No subscribers is fine.
        let _ = self.events.send(OutputEvent {
            seq: self.seq,
            text: message.text.clone(),
            attempts,
            outcome,
        });
    }
}

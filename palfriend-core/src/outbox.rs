//! Outbox batcher: coalesces candidate lines into one spoken payload.
//!
//! ## Buffer rules
//!
//! - Blank text is ignored.
//! - A new line whose merge key and priority equal those of the most recently
//!   added item is appended to that item (`"hi"` + `"there"` → `"hi there"`).
//! - The buffer is kept stably sorted by priority, highest first.
//! - Reaching `max_items`, or a joined payload longer than `max_chars`,
//!   flushes synchronously from within `add`.
//!
//! ## Timed flush
//!
//! [`OutboxBatcher::run`] polls every `tick`. While the streamer or the
//! avatar is talking nothing is flushed; otherwise the buffer is flushed once
//! its oldest item is older than `window`.
//!
//! The buffer lock is released before the payload is handed to the
//! [`FlushSink`]; sink errors are returned to whoever triggered the flush.

use std::cmp::Reverse;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OutboxConfig;
use crate::diagnostics::PipelineDiagnostics;
use crate::error::Result;
use crate::speech::ActivityGates;

/// Receiver of flushed payloads (normally the sender's outbound queue).
#[async_trait]
pub trait FlushSink: Send + Sync + 'static {
    async fn deliver(&self, payload: String) -> Result<()>;
}

/// One pending line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub priority: i32,
    pub text: String,
    pub merge_key: Option<String>,
    /// Arrival order of the most recent text folded into this item.
    seq: u64,
}

#[derive(Debug, Default)]
struct Buffer {
    items: Vec<BatchItem>,
    first_at: Option<Instant>,
    next_seq: u64,
}

impl Buffer {
    fn insert(&mut self, text: &str, priority: i32, merge_key: Option<&str>) -> bool {
        let seq = self.next_seq;
        self.next_seq += 1;

        let last = self.items.iter_mut().max_by_key(|item| item.seq);
        if let (Some(last), Some(key)) = (last, merge_key) {
            if last.priority == priority && last.merge_key.as_deref() == Some(key) {
                last.text.push(' ');
                last.text.push_str(text);
                last.seq = seq;
                return true;
            }
        }

        self.items.push(BatchItem {
            priority,
            text: text.to_string(),
            merge_key: merge_key.map(str::to_string),
            seq,
        });
        // Stable: equal priorities keep arrival order.
        self.items.sort_by_key(|item| Reverse(item.priority));
        false
    }

    fn joined_len(&self, separator: &str) -> usize {
        let text: usize = self.items.iter().map(|i| i.text.chars().count()).sum();
        let seps = self.items.len().saturating_sub(1) * separator.chars().count();
        text + seps
    }

    fn take_payload(&mut self, separator: &str) -> Option<String> {
        if self.items.is_empty() {
            return None;
        }
        let payload = self
            .items
            .iter()
            .map(|i| i.text.as_str())
            .collect::<Vec<_>>()
            .join(separator);
        self.items.clear();
        self.first_at = None;
        Some(payload)
    }
}

pub struct OutboxBatcher {
    config: OutboxConfig,
    buffer: Mutex<Buffer>,
    sink: Arc<dyn FlushSink>,
    gates: ActivityGates,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl OutboxBatcher {
    pub fn new(
        config: OutboxConfig,
        sink: Arc<dyn FlushSink>,
        gates: ActivityGates,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Self {
        Self {
            config,
            buffer: Mutex::new(Buffer::default()),
            sink,
            gates,
            diagnostics,
        }
    }

    /// Buffer a line, flushing immediately when a size budget is hit.
    pub async fn add(&self, text: &str, priority: i32, merge_key: Option<&str>) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        let payload = {
            let mut buf = self.buffer.lock();
            let merged = buf.insert(text, priority, merge_key);
            if merged {
                debug!(priority, merge_key, "batch merge");
            } else {
                debug!(priority, merge_key, text, "batch add");
            }
            if buf.first_at.is_none() {
                buf.first_at = Some(Instant::now());
            }

            let over_budget = buf.joined_len(&self.config.separator) > self.config.max_chars
                || buf.items.len() >= self.config.max_items;
            if over_budget {
                buf.take_payload(&self.config.separator)
            } else {
                None
            }
        };

        match payload {
            Some(payload) => self.deliver(payload).await,
            None => Ok(()),
        }
    }

    /// Flush whatever is buffered. Returns whether anything was sent.
    pub async fn flush(&self) -> Result<bool> {
        let payload = self.buffer.lock().take_payload(&self.config.separator);
        match payload {
            Some(payload) => self.deliver(payload).await.map(|()| true),
            None => Ok(false),
        }
    }

    /// One worker iteration. Returns whether a flush happened.
    pub async fn tick(&self) -> Result<bool> {
        if !self.gates.is_quiet() {
            return Ok(false);
        }
        let payload = {
            let mut buf = self.buffer.lock();
            match buf.first_at {
                Some(first) if first.elapsed() >= self.config.window() => {
                    buf.take_payload(&self.config.separator)
                }
                _ => None,
            }
        };
        match payload {
            Some(payload) => self.deliver(payload).await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Timed-flush worker. Sink failures are logged; the loop keeps running.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("outbox flush failed: {e}");
                    }
                }
            }
        }
        debug!("outbox worker stopped");
    }

    /// Snapshot of the pending items in flush order.
    pub fn pending(&self) -> Vec<BatchItem> {
        self.buffer.lock().items.clone()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn deliver(&self, payload: String) -> Result<()> {
        self.diagnostics
            .batches_flushed
            .fetch_add(1, Ordering::Relaxed);
        info!(payload = %payload, "batch flush");
        self.sink.deliver(payload).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::PalfriendError;
    use crate::speech::{MicState, SpeechState};
    use std::time::Duration;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FlushSink for RecordingSink {
        async fn deliver(&self, payload: String) -> Result<()> {
            self.sent.lock().push(payload);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl FlushSink for FailingSink {
        async fn deliver(&self, _payload: String) -> Result<()> {
            Err(PalfriendError::QueueClosed)
        }
    }

    fn gates() -> ActivityGates {
        ActivityGates::new(Arc::new(SpeechState::new()), Arc::new(MicState::new()))
    }

    fn batcher(max_items: usize, max_chars: usize) -> (OutboxBatcher, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let config = OutboxConfig {
            window_secs: 10.0,
            max_items,
            max_chars,
            separator: "•".into(),
            tick_ms: 250,
        };
        let b = OutboxBatcher::new(
            config,
            sink.clone(),
            gates(),
            Arc::new(PipelineDiagnostics::default()),
        );
        (b, sink)
    }

    fn texts(b: &OutboxBatcher) -> Vec<String> {
        b.pending().into_iter().map(|i| i.text).collect()
    }

    #[tokio::test]
    async fn max_items_flushes_once_and_empties() {
        let (b, sink) = batcher(3, 1_000);
        b.add("A", 1, None).await.expect("add");
        b.add("B", 1, None).await.expect("add");
        assert!(sink.sent.lock().is_empty());
        b.add("C", 1, None).await.expect("add");

        assert_eq!(&*sink.sent.lock(), &vec!["A•B•C".to_string()]);
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn same_key_same_priority_merges() {
        let (b, _sink) = batcher(10, 1_000);
        b.add("hi", 1, Some("u1")).await.expect("add");
        b.add("there", 1, Some("u1")).await.expect("add");
        assert_eq!(texts(&b), vec!["hi there"]);
    }

    #[tokio::test]
    async fn merge_requires_matching_priority_and_key() {
        let (b, _sink) = batcher(10, 1_000);
        b.add("one", 1, Some("u1")).await.expect("add");
        b.add("two", 2, Some("u1")).await.expect("add");
        b.add("three", 2, Some("u2")).await.expect("add");
        b.add("four", 2, None).await.expect("add");
        b.add("five", 2, None).await.expect("add");
        assert_eq!(texts(&b), vec!["two", "three", "four", "five", "one"]);
    }

    #[tokio::test]
    async fn merge_targets_most_recent_arrival_not_last_in_sort_order() {
        let (b, _sink) = batcher(10, 1_000);
        b.add("low", 1, Some("u1")).await.expect("add");
        b.add("high", 5, Some("u2")).await.expect("add");
        // Most recent arrival is "high" (u2); "low" is only last in sort order.
        b.add("again", 1, Some("u1")).await.expect("add");
        assert_eq!(texts(&b), vec!["high", "low", "again"]);
    }

    #[tokio::test]
    async fn priority_order_is_descending_and_stable() {
        let (b, sink) = batcher(10, 1_000);
        b.add("Normal", 1, None).await.expect("add");
        b.add("Important", 5, None).await.expect("add");
        b.add("Low", 0, None).await.expect("add");
        assert_eq!(texts(&b), vec!["Important", "Normal", "Low"]);

        assert!(b.flush().await.expect("flush"));
        assert_eq!(&*sink.sent.lock(), &vec!["Important•Normal•Low".to_string()]);
    }

    #[tokio::test]
    async fn blank_text_is_ignored() {
        let (b, _sink) = batcher(10, 1_000);
        b.add("", 1, None).await.expect("add");
        b.add("   ", 1, None).await.expect("add");
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn char_budget_triggers_flush() {
        let (b, sink) = batcher(10, 10);
        b.add("12345", 1, None).await.expect("add");
        assert!(sink.sent.lock().is_empty());
        // "12345•67890" is 11 chars > 10.
        b.add("67890", 1, None).await.expect("add");
        assert_eq!(sink.sent.lock().len(), 1);
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn flush_on_empty_buffer_is_noop() {
        let (b, sink) = batcher(10, 1_000);
        assert!(!b.flush().await.expect("flush"));
        assert!(sink.sent.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_waits_for_window() {
        let (b, sink) = batcher(10, 1_000);
        b.add("hello", 1, None).await.expect("add");
        assert!(!b.tick().await.expect("tick"));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(b.tick().await.expect("tick"));
        assert_eq!(&*sink.sent.lock(), &vec!["hello".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_holds_while_speaking_and_flushes_after() {
        let (b, sink) = batcher(10, 1_000);
        b.gates.speech.mark_started();
        b.add("hello", 1, None).await.expect("add");
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!b.tick().await.expect("tick"));
        assert!(sink.sent.lock().is_empty());

        b.gates.speech.mark_ended();
        assert!(b.tick().await.expect("tick"));
        assert_eq!(sink.sent.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_holds_while_mic_active() {
        let (b, sink) = batcher(10, 1_000);
        b.gates.mic.mark_active();
        b.add("hello", 1, None).await.expect("add");
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!b.tick().await.expect("tick"));
        b.gates.mic.mark_idle();
        assert!(b.tick().await.expect("tick"));
        assert_eq!(sink.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn sink_errors_propagate_to_caller() {
        let b = OutboxBatcher::new(
            OutboxConfig {
                max_items: 1,
                ..OutboxConfig::default()
            },
            Arc::new(FailingSink),
            gates(),
            Arc::new(PipelineDiagnostics::default()),
        );
        let err = b.add("boom", 1, None).await;
        assert!(matches!(err, Err(PalfriendError::QueueClosed)));
        assert!(b.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_survives_sink_errors() {
        let b = Arc::new(OutboxBatcher::new(
            OutboxConfig {
                window_secs: 1.0,
                ..OutboxConfig::default()
            },
            Arc::new(FailingSink),
            gates(),
            Arc::new(PipelineDiagnostics::default()),
        ));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&b).run(cancel.clone()));

        b.add("first", 1, None).await.expect("add");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(b.is_empty());

        b.add("second", 1, None).await.expect("add");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(b.is_empty());
        assert!(!worker.is_finished());

        cancel.cancel();
        worker.await.expect("worker panicked");
    }
}

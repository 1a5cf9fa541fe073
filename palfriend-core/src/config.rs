//! Structured pipeline configuration.
//!
//! Every option has a default taken from the live deployment profile, so a
//! partial settings file deserialises cleanly (`#[serde(default)]` on every
//! section). Call [`CompanionConfig::validate`] once at startup.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PalfriendError, Result};
use crate::event::EventKind;

/// Threshold above which a configured `reply_threshold` is considered a typo.
pub const MAX_REPLY_THRESHOLD: f32 = 0.8;
/// Value used instead of an out-of-range `reply_threshold`.
pub const DEFAULT_REPLY_THRESHOLD: f32 = 0.4;
/// Slowest accepted refill rate (one token per ~17 minutes).
pub const MIN_REFILL_PER_SEC: f64 = 0.001;
/// Longest accepted outbox window.
pub const MAX_WINDOW_SECS: f64 = 3600.0;

/// Top-level configuration for the companion pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    pub dedup: DedupConfig,
    pub rate_limit: RateLimitConfig,
    pub outbox: OutboxConfig,
    pub greeting: GreetingConfig,
    pub speech: SpeechConfig,
    pub sender: SenderConfig,
    pub comment: CommentConfig,
    pub events: EventConfig,
    pub mic: MicConfig,
}

impl CompanionConfig {
    /// Reject values the pipeline cannot run with.
    ///
    /// Missing priority entries are filled in from the defaults instead of
    /// failing, since older settings files predate some event kinds.
    pub fn validate(&mut self) -> Result<()> {
        let d = &self.dedup;
        if d.ttl_secs == 0 {
            return Err(invalid("dedup.ttl_secs must be > 0"));
        }
        if d.hard_cap == 0 || d.trim_target == 0 {
            return Err(invalid("dedup.hard_cap and dedup.trim_target must be > 0"));
        }
        if d.trim_target > d.hard_cap {
            return Err(invalid("dedup.trim_target must not exceed dedup.hard_cap"));
        }
        if d.sweep_threshold > d.hard_cap {
            return Err(invalid("dedup.sweep_threshold must not exceed dedup.hard_cap"));
        }

        if self.rate_limit.capacity == 0 {
            return Err(invalid("rate_limit.capacity must be > 0"));
        }
        let rate = self.rate_limit.refill_per_sec;
        if !rate.is_finite() || rate < MIN_REFILL_PER_SEC {
            return Err(invalid("rate_limit.refill_per_sec must be finite and >= 0.001"));
        }

        let o = &self.outbox;
        if o.max_items == 0 || o.max_chars == 0 {
            return Err(invalid("outbox.max_items and outbox.max_chars must be > 0"));
        }
        if o.tick_ms == 0 {
            return Err(invalid("outbox.tick_ms must be > 0"));
        }
        if !(0.0..=MAX_WINDOW_SECS).contains(&o.window_secs) {
            return Err(invalid("outbox.window_secs must be between 0 and 3600"));
        }

        if self.greeting.announce_batch == 0 {
            return Err(invalid("greeting.announce_batch must be > 0"));
        }
        if self.greeting.announcer_tick_ms == 0 {
            return Err(invalid("greeting.announcer_tick_ms must be > 0"));
        }

        if self.sender.max_attempts == 0 {
            return Err(invalid("sender.max_attempts must be > 0"));
        }
        if self.sender.max_line_length < 2 {
            return Err(invalid("sender.max_line_length must be >= 2"));
        }

        if self.events.queue_capacity == 0 {
            return Err(invalid("events.queue_capacity must be > 0"));
        }
        if self.events.fan_in_tick_ms == 0 {
            return Err(invalid("events.fan_in_tick_ms must be > 0"));
        }
        let defaults = EventConfig::default_priorities();
        for (kind, priority) in defaults {
            self.events.priority.entry(kind).or_insert(priority);
        }

        if self.comment.reply_threshold > MAX_REPLY_THRESHOLD {
            tracing::info!(
                configured = self.comment.reply_threshold,
                fallback = DEFAULT_REPLY_THRESHOLD,
                "reply_threshold too high, using fallback"
            );
            self.comment.reply_threshold = DEFAULT_REPLY_THRESHOLD;
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> PalfriendError {
    PalfriendError::InvalidConfig(msg.to_string())
}

/// Deduplicator retention and housekeeping thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a signature stays "seen". Default: 600.
    pub ttl_secs: u64,
    /// Store size above which expired entries are swept. Default: 1000.
    pub sweep_threshold: usize,
    /// Store size above which the oldest entries are evicted. Default: 5000.
    pub hard_cap: usize,
    /// Size the hard-cap eviction trims down to. Default: 4000.
    pub trim_target: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            sweep_threshold: 1_000,
            hard_cap: 5_000,
            trim_target: 4_000,
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Token bucket guarding reply generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // 20 replies per minute.
        Self {
            capacity: 20,
            refill_per_sec: 20.0 / 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Age of the oldest buffered item before a timed flush. Default: 8.
    pub window_secs: f64,
    pub max_items: usize,
    /// Character budget of the joined payload. Default: 320.
    pub max_chars: usize,
    pub separator: String,
    /// Worker poll interval. Default: 250.
    pub tick_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            window_secs: 8.0,
            max_items: 8,
            max_chars: 320,
            separator: " • ".into(),
            tick_ms: 250,
        }
    }
}

impl OutboxConfig {
    pub fn window(&self) -> Duration {
        Duration::try_from_secs_f64(self.window_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GreetingConfig {
    pub enabled: bool,
    /// Delay between a join and the greet check. Default: 30.
    pub delay_secs: u64,
    /// Per-viewer cooldown tracked in the memory store. Default: 360.
    pub cooldown_secs: u64,
    /// A viewer active within this window counts as present. Default: 45.
    pub presence_secs: u64,
    /// Quiet time required since the last output before announcing. Default: 25.
    pub min_idle_since_output_secs: u64,
    /// Minimum gap between two arrival announcements. Default: 180.
    pub global_cooldown_secs: u64,
    pub announce_batch: usize,
    pub announce_prefix: String,
    pub announce_priority: i32,
    pub announcer_tick_ms: u64,
    /// Viewers idle longer than this are dropped from the live table. Default: 6 h.
    pub viewer_idle_prune_secs: u64,
}

impl Default for GreetingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_secs: 30,
            cooldown_secs: 360,
            presence_secs: 45,
            min_idle_since_output_secs: 25,
            global_cooldown_secs: 180,
            announce_batch: 20,
            announce_prefix: "Neu dabei: ".into(),
            announce_priority: 1,
            announcer_tick_ms: 1_000,
            viewer_idle_prune_secs: 6 * 3600,
        }
    }
}

impl GreetingConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn presence(&self) -> Duration {
        Duration::from_secs(self.presence_secs)
    }

    pub fn min_idle_since_output(&self) -> Duration {
        Duration::from_secs(self.min_idle_since_output_secs)
    }

    pub fn global_cooldown(&self) -> Duration {
        Duration::from_secs(self.global_cooldown_secs)
    }

    pub fn announcer_tick(&self) -> Duration {
        Duration::from_millis(self.announcer_tick_ms)
    }

    pub fn viewer_idle_prune(&self) -> Duration {
        Duration::from_secs(self.viewer_idle_prune_secs)
    }
}

/// Turn-taking timeouts around a single emitted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Wait for the channel's speech-start signal after sending.
    pub await_signals: bool,
    pub wait_start_timeout_ms: u64,
    pub max_speech_ms: u64,
    pub post_gap_ms: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            await_signals: true,
            wait_start_timeout_ms: 1_200,
            max_speech_ms: 15_000,
            post_gap_ms: 250,
        }
    }
}

impl SpeechConfig {
    pub fn wait_start_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_start_timeout_ms)
    }

    pub fn max_speech(&self) -> Duration {
        Duration::from_millis(self.max_speech_ms)
    }

    pub fn post_gap(&self) -> Duration {
        Duration::from_millis(self.post_gap_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub inter_message_gap_ms: u64,
    /// Outbound lines are trimmed to this many characters. Default: 140.
    pub max_line_length: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            inter_message_gap_ms: 20,
            max_line_length: 140,
        }
    }
}

impl SenderConfig {
    /// Exponential backoff for the given (1-based) failed attempt:
    /// `min(base * 2^(attempt-1), max)`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = Duration::from_millis(self.backoff_base_ms).saturating_mul(multiplier);
        delay.min(Duration::from_millis(self.backoff_max_ms))
    }

    pub fn inter_message_gap(&self) -> Duration {
        Duration::from_millis(self.inter_message_gap_ms)
    }
}

/// Comment handling: filters, cooldowns and quick replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentConfig {
    pub enabled: bool,
    pub min_length: usize,
    pub global_cooldown_secs: u64,
    pub per_user_cooldown_secs: u64,
    pub reply_threshold: f32,
    pub respond_to_greetings: bool,
    pub greeting_cooldown_secs: u64,
    pub respond_to_thanks: bool,
    pub ignore_if_startswith: Vec<String>,
    pub ignore_contains: Vec<String>,
    pub keywords_bonus: Vec<String>,
    pub greetings: Vec<String>,
    pub thanks: Vec<String>,
}

impl Default for CommentConfig {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            enabled: true,
            min_length: 3,
            global_cooldown_secs: 6,
            per_user_cooldown_secs: 15,
            reply_threshold: 0.6,
            respond_to_greetings: true,
            greeting_cooldown_secs: 360,
            respond_to_thanks: true,
            ignore_if_startswith: words(&["!"]),
            ignore_contains: words(&["http://", "https://", "discord.gg"]),
            keywords_bonus: words(&[
                "warum", "wieso", "wie", "wann", "wo", "wer", "was", "welche", "welcher",
                "welches", "why", "how", "when", "where", "who", "what", "which",
            ]),
            greetings: words(&[
                "hallo",
                "hi",
                "hey",
                "servus",
                "moin",
                "gruss",
                "grüß",
                "grüss",
                "guten morgen",
                "guten abend",
                "hello",
            ]),
            thanks: words(&["danke", "thx", "thanks", "ty", "merci"]),
        }
    }
}

impl CommentConfig {
    pub fn global_cooldown(&self) -> Duration {
        Duration::from_secs(self.global_cooldown_secs)
    }

    pub fn per_user_cooldown(&self) -> Duration {
        Duration::from_secs(self.per_user_cooldown_secs)
    }

    pub fn greeting_cooldown(&self) -> Duration {
        Duration::from_secs(self.greeting_cooldown_secs)
    }
}

/// Intake queues and per-kind output priorities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub priority: BTreeMap<EventKind, i32>,
    /// Likes below this count are not announced. Default: 20.
    pub like_threshold: u32,
    /// Minimum gap between two accepted follow events. Default: 6.
    pub follow_cooldown_secs: u64,
    pub queue_capacity: usize,
    /// Bounded wait of the fan-in consumer per iteration. Default: 200.
    pub fan_in_tick_ms: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            priority: Self::default_priorities().into_iter().collect(),
            like_threshold: 20,
            follow_cooldown_secs: 6,
            queue_capacity: 1_024,
            fan_in_tick_ms: 200,
        }
    }
}

impl EventConfig {
    fn default_priorities() -> [(EventKind, i32); 7] {
        [
            (EventKind::Gift, 3),
            (EventKind::Subscribe, 3),
            (EventKind::Follow, 2),
            (EventKind::Share, 2),
            (EventKind::Like, 1),
            (EventKind::Join, 1),
            (EventKind::Comment, 1),
        ]
    }

    pub fn priority_of(&self, kind: EventKind) -> i32 {
        self.priority.get(&kind).copied().unwrap_or(1)
    }

    pub fn follow_cooldown(&self) -> Duration {
        Duration::from_secs(self.follow_cooldown_secs)
    }

    pub fn fan_in_tick(&self) -> Duration {
        Duration::from_millis(self.fan_in_tick_ms)
    }
}

/// Microphone activity gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MicConfig {
    pub enabled: bool,
    /// Preferred input device name; empty selects the default device.
    pub device: String,
    /// RMS level at or above which the streamer counts as talking. Default: 0.02.
    pub threshold: f32,
    pub attack_ms: u64,
    pub release_ms: u64,
}

impl Default for MicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: String::new(),
            threshold: 0.02,
            attack_ms: 120,
            release_ms: 1_200,
        }
    }
}

impl MicConfig {
    pub fn attack(&self) -> Duration {
        Duration::from_millis(self.attack_ms)
    }

    pub fn release(&self) -> Duration {
        Duration::from_millis(self.release_ms)
    }
}

//! # palfriend-core
//!
//! Live-stream interaction pipeline: admits platform events, paces and
//! batches the companion's reactions, and delivers them to a speaking
//! output channel one line at a time.
//!
//! ## Architecture
//!
//! ```text
//! LiveEvent → EventIntake (validate, filter, dedup, follow cooldown)
//!                 │
//!        ┌────────┴──────────────┐
//!  comment queue          gift/like/join/follow/share/subscribe queues
//!        │                       │
//!  CommentProcessor        EventDispatcher ── join ──► GreetingScheduler
//!  (TokenBucket, cooldowns)      │                         │ (announcer)
//!        └──────────┬────────────┴─────────────────────────┘
//!                   ▼
//!             OutboxBatcher (priority, merge, budget, quiet-window flush)
//!                   │
//!             OutboundQueue → OutputWorker → OutputChannel
//!                                 │
//!                   SpeechState / MicState gates (speech + mic monitor)
//! ```
//!
//! Nothing is spoken while the companion or the host's microphone is active.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod channel;
pub mod classify;
pub mod config;
pub mod dedup;
pub mod diagnostics;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod greeting;
pub mod intake;
pub mod ipc;
pub mod memory;
pub mod mic;
pub mod outbox;
pub mod rate_limit;
pub mod sender;
pub mod speech;
pub mod viewer;

// Convenience re-exports for downstream crates
pub use channel::OutputChannel;
pub use config::CompanionConfig;
pub use diagnostics::DiagnosticsSnapshot;
pub use dispatch::{NoReply, Responder};
pub use engine::{CompanionEngine, PipelineContext};
pub use error::{ChannelError, PalfriendError};
pub use event::{Actor, EventKind, EventPayload, LiveEvent};
pub use intake::{EventIntake, IntakeOutcome};
pub use ipc::events::{EngineStatus, EngineStatusEvent, MicLevelEvent, OutputEvent, OutputOutcome};
pub use memory::{InMemoryStore, MemoryStore};
pub use speech::{MicState, SpeechState};

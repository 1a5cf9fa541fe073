//! Observer events broadcast by the engine.
//!
//! | Event | Source |
//! |-------|--------|
//! | `OutputEvent` | sender worker, once per message outcome |
//! | `EngineStatusEvent` | engine lifecycle |
//! | `MicLevelEvent` | mic monitor, once per processed chunk |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Output events
// ---------------------------------------------------------------------------

/// Emitted when the sender finishes with a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub text: String,
    /// Send attempts made, including the final one.
    pub attempts: u32,
    pub outcome: OutputOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputOutcome {
    Sent,
    /// Attempt budget exhausted.
    Dropped,
}

// ---------------------------------------------------------------------------
// Mic level events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicLevelEvent {
    pub seq: u64,
    /// Root-mean-square level of the chunk in [0.0, 1.0].
    pub rms: f32,
    /// Gate state after this chunk.
    pub is_active: bool,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Why a status was re-broadcast, such as the mic gate failing to open.
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Created, `start()` not yet called.
    Idle,
    /// Workers running and accepting events.
    Running,
    /// Workers stopped; the engine may be restarted.
    Stopped,
}

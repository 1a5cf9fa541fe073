//! Speech/Mic coordinator: two independent two-state machines.
//!
//! ```text
//! SpeechState:  Idle ──mark_started──► Speaking ──mark_ended──► Idle
//! MicState:     Idle ──mark_active───► Active   ──mark_idle───► Idle
//! ```
//!
//! Both are backed by a `tokio::sync::watch` channel so waiters wake on the
//! edge without polling. `mark_*` calls are synchronous and may come from
//! any thread (the mic monitor drives `MicState` from a blocking thread).

use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechPhase {
    Idle,
    Speaking,
}

/// Whether the avatar is currently talking.
#[derive(Debug)]
pub struct SpeechState {
    tx: watch::Sender<SpeechPhase>,
}

impl Default for SpeechState {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SpeechPhase::Idle);
        Self { tx }
    }

    /// Idle → Speaking. Returns whether a transition happened.
    pub fn mark_started(&self) -> bool {
        let changed = self.set(SpeechPhase::Speaking);
        if changed {
            info!("speech started");
        }
        changed
    }

    /// Speaking → Idle. Returns whether a transition happened.
    pub fn mark_ended(&self) -> bool {
        let changed = self.set(SpeechPhase::Idle);
        if changed {
            info!("speech ended");
        }
        changed
    }

    pub fn phase(&self) -> SpeechPhase {
        *self.tx.borrow()
    }

    pub fn is_speaking(&self) -> bool {
        self.phase() == SpeechPhase::Speaking
    }

    /// Suspend until Idle.
    pub async fn wait_idle(&self) {
        self.wait_for(SpeechPhase::Idle).await;
    }

    /// Suspend until Speaking or `timeout` elapses. Returns whether speech started.
    pub async fn wait_started(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for(SpeechPhase::Speaking))
            .await
            .is_ok()
    }

    /// Suspend until Idle or `timeout` elapses. Returns whether speech ended.
    pub async fn wait_ended(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for(SpeechPhase::Idle))
            .await
            .is_ok()
    }

    fn set(&self, phase: SpeechPhase) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        })
    }

    async fn wait_for(&self, phase: SpeechPhase) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|p| *p == phase).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicPhase {
    Idle,
    Active,
}

/// Whether the human streamer is currently talking into the microphone.
#[derive(Debug)]
pub struct MicState {
    tx: watch::Sender<MicPhase>,
}

impl Default for MicState {
    fn default() -> Self {
        Self::new()
    }
}

impl MicState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(MicPhase::Idle);
        Self { tx }
    }

    pub fn mark_active(&self) -> bool {
        let changed = self.set(MicPhase::Active);
        if changed {
            info!("mic active");
        }
        changed
    }

    pub fn mark_idle(&self) -> bool {
        let changed = self.set(MicPhase::Idle);
        if changed {
            info!("mic idle");
        }
        changed
    }

    pub fn phase(&self) -> MicPhase {
        *self.tx.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.phase() == MicPhase::Active
    }

    pub async fn wait_idle(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|p| *p == MicPhase::Idle).await;
    }

    fn set(&self, phase: MicPhase) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        })
    }
}

/// Read-only view over both machines for gating logic.
#[derive(Debug, Clone)]
pub struct ActivityGates {
    pub speech: std::sync::Arc<SpeechState>,
    pub mic: std::sync::Arc<MicState>,
}

impl ActivityGates {
    pub fn new(speech: std::sync::Arc<SpeechState>, mic: std::sync::Arc<MicState>) -> Self {
        Self { speech, mic }
    }

    /// True when neither the avatar nor the streamer is talking.
    pub fn is_quiet(&self) -> bool {
        !self.speech.is_speaking() && !self.mic.is_active()
    }
}

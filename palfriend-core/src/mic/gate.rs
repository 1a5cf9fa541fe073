//! Attack/release activity gate over chunk RMS levels.
//!
//! ## Algorithm
//!
//! 1. Compute the RMS of the incoming chunk.
//! 2. While Idle, accumulate time spent at or above `threshold`; once it
//!    reaches `attack` → Active. Any quiet chunk resets the accumulator.
//! 3. While Active, accumulate time spent below `threshold`; once it reaches
//!    `release` → Idle. Any loud chunk resets the accumulator.
//!
//! Time is measured in audio duration, not wall time, so the gate is
//! deterministic for a given sample stream.

use std::time::Duration;

use crate::buffering::chunk::AudioChunk;
use crate::config::MicConfig;

/// State edge produced by [`ActivityGate::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEdge {
    Activated,
    Released,
}

#[derive(Debug, Clone)]
pub struct ActivityGate {
    threshold: f32,
    attack: Duration,
    release: Duration,
    active: bool,
    /// Loud time while Idle, or quiet time while Active.
    pending: Duration,
}

impl ActivityGate {
    pub fn new(threshold: f32, attack: Duration, release: Duration) -> Self {
        Self {
            threshold,
            attack,
            release,
            active: false,
            pending: Duration::ZERO,
        }
    }

    pub fn from_config(config: &MicConfig) -> Self {
        Self::new(config.threshold, config.attack(), config.release())
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feed one chunk. Returns the edge crossed, if any.
    pub fn update(&mut self, chunk: &AudioChunk) -> Option<GateEdge> {
        self.update_level(chunk.rms(), chunk.duration())
    }

    pub fn update_level(&mut self, rms: f32, span: Duration) -> Option<GateEdge> {
        let loud = rms >= self.threshold;
        if loud != self.active {
            self.pending += span;
        } else {
            self.pending = Duration::ZERO;
        }

        let limit = if self.active { self.release } else { self.attack };
        if loud != self.active && self.pending >= limit {
            self.active = loud;
            self.pending = Duration::ZERO;
            return Some(if loud {
                GateEdge::Activated
            } else {
                GateEdge::Released
            });
        }
        None
    }

    pub fn reset(&mut self) {
        self.active = false;
        self.pending = Duration::ZERO;
    }
}

//! Blocking mic monitor loop.
//!
//! ## Per iteration
//!
//! ```text
//! 1. Drain the ring buffer in fixed CHUNK_MS chunks
//! 2. Gate update (RMS, attack/release) → MicState::mark_active / mark_idle
//! 3. Broadcast MicLevelEvent
//! 4. Nothing buffered → sleep POLL_INTERVAL
//! ```
//!
//! Runs on a `spawn_blocking` thread next to the capture stream so the async
//! executor never touches audio.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ringbuf::traits::Observer;
use tokio::sync::broadcast;
use tracing::debug;

use crate::buffering::chunk::AudioChunk;
use crate::buffering::{AudioConsumer, Consumer};
use crate::config::MicConfig;
use crate::ipc::events::MicLevelEvent;
use crate::mic::gate::{ActivityGate, GateEdge};
use crate::speech::MicState;

pub const CHUNK_MS: u32 = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct MicMonitor {
    gate: ActivityGate,
    consumer: AudioConsumer,
    sample_rate: u32,
    chunk_len: usize,
    scratch: Vec<f32>,
    mic: Arc<MicState>,
    levels: broadcast::Sender<MicLevelEvent>,
    seq: u64,
}

impl MicMonitor {
    pub fn new(
        config: &MicConfig,
        consumer: AudioConsumer,
        sample_rate: u32,
        mic: Arc<MicState>,
        levels: broadcast::Sender<MicLevelEvent>,
    ) -> Self {
        let chunk_len = ((sample_rate as usize * CHUNK_MS as usize) / 1_000).max(1);
        Self {
            gate: ActivityGate::from_config(config),
            consumer,
            sample_rate,
            chunk_len,
            scratch: Vec::with_capacity(chunk_len),
            mic,
            levels,
            seq: 0,
        }
    }

    /// Process every complete chunk currently buffered.
    pub fn drain(&mut self) -> usize {
        let mut processed = 0;
        while self.consumer.occupied_len() >= self.chunk_len {
            self.scratch.resize(self.chunk_len, 0.0);
            let read = self.consumer.pop_slice(&mut self.scratch);
            self.scratch.truncate(read);
            let chunk = AudioChunk::new(std::mem::take(&mut self.scratch), self.sample_rate);
            self.feed(&chunk);
            self.scratch = chunk.samples;
            processed += 1;
        }
        processed
    }

    pub fn feed(&mut self, chunk: &AudioChunk) {
        match self.gate.update(chunk) {
            Some(GateEdge::Activated) => {
                self.mic.mark_active();
            }
            Some(GateEdge::Released) => {
                self.mic.mark_idle();
            }
            None => {}
        }
        self.seq += 1;
        let _ = self.levels.send(MicLevelEvent {
            seq: self.seq,
            rms: chunk.rms(),
            is_active: self.gate.is_active(),
        });
    }

    /// Loop until `running` is cleared. Leaves the mic Idle on exit.
    pub fn run(mut self, running: Arc<AtomicBool>) {
        debug!(sample_rate = self.sample_rate, chunk_len = self.chunk_len, "mic monitor started");
        while running.load(Ordering::Relaxed) {
            if self.drain() == 0 {
                std::thread::sleep(POLL_INTERVAL);
            }
        }
        self.gate.reset();
        self.mic.mark_idle();
        debug!("mic monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{create_audio_ring, Producer};

    fn config() -> MicConfig {
        MicConfig {
            threshold: 0.02,
            attack_ms: 40,
            release_ms: 100,
            ..MicConfig::default()
        }
    }

    #[test]
    fn drain_processes_whole_chunks_only() {
        let (mut producer, consumer) = create_audio_ring();
        let (levels, mut rx) = broadcast::channel(16);
        let mut monitor = MicMonitor::new(&config(), consumer, 16_000, Arc::new(MicState::new()), levels);

        // 20 ms at 16 kHz = 320 samples per chunk.
        producer.push_slice(&vec![0.0f32; 700]);
        assert_eq!(monitor.drain(), 2);
        assert_eq!(monitor.drain(), 0);
        assert_eq!(rx.try_recv().map(|e| e.seq).ok(), Some(1));
        assert_eq!(rx.try_recv().map(|e| e.seq).ok(), Some(2));
    }

    #[test]
    fn loud_then_quiet_drives_mic_state() {
        let (mut producer, consumer) = create_audio_ring();
        let (levels, _rx) = broadcast::channel(64);
        let mic = Arc::new(MicState::new());
        let mut monitor = MicMonitor::new(&config(), consumer, 16_000, Arc::clone(&mic), levels);

        producer.push_slice(&vec![0.3f32; 320]);
        monitor.drain();
        assert!(!mic.is_active());

        producer.push_slice(&vec![0.3f32; 320]);
        monitor.drain();
        assert!(mic.is_active());

        producer.push_slice(&vec![0.0f32; 320 * 4]);
        monitor.drain();
        assert!(mic.is_active());

        producer.push_slice(&vec![0.0f32; 320]);
        monitor.drain();
        assert!(!mic.is_active());
    }

    #[test]
    fn run_loop_exits_idle_when_stopped() {
        let (mut producer, consumer) = create_audio_ring();
        let (levels, _rx) = broadcast::channel(64);
        let mic = Arc::new(MicState::new());
        let monitor = MicMonitor::new(&config(), consumer, 16_000, Arc::clone(&mic), levels);
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = Arc::clone(&running);
            std::thread::spawn(move || monitor.run(running))
        };

        producer.push_slice(&vec![0.3f32; 320 * 3]);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !mic.is_active() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(mic.is_active());

        running.store(false, Ordering::Relaxed);
        handle.join().expect("monitor thread panicked");
        assert!(!mic.is_active());
    }
}

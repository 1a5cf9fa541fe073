//! Lock-free SPSC ring buffer between the capture callback and the mic monitor.
//!
//! Uses `ringbuf::HeapRb<f32>`, whose `push_slice` is wait-free and safe to
//! call from the real-time audio callback.

pub mod chunk;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Producer half, held by the audio callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the mic monitor thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// 2^16 samples ≈ 1.4 s at 48 kHz. The monitor drains every few ms, so
/// this only has to absorb scheduling hiccups.
pub const RING_CAPACITY: usize = 1 << 16;

pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

//! Microphone activity: a level gate and the loop that feeds it.

pub mod gate;
pub mod monitor;

pub use gate::{ActivityGate, GateEdge};
pub use monitor::MicMonitor;

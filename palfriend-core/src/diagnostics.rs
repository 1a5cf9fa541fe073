//! Lock-free pipeline counters.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct PipelineDiagnostics {
    pub events_in: AtomicUsize,
    pub events_duplicate: AtomicUsize,
    pub events_dropped: AtomicUsize,
    pub replies_requested: AtomicUsize,
    pub batches_flushed: AtomicUsize,
    pub messages_sent: AtomicUsize,
    pub send_failures: AtomicUsize,
    pub messages_dropped: AtomicUsize,
    pub greetings_scheduled: AtomicUsize,
    pub greetings_announced: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        DiagnosticsSnapshot {
            events_in: load(&self.events_in),
            events_duplicate: load(&self.events_duplicate),
            events_dropped: load(&self.events_dropped),
            replies_requested: load(&self.replies_requested),
            batches_flushed: load(&self.batches_flushed),
            messages_sent: load(&self.messages_sent),
            send_failures: load(&self.send_failures),
            messages_dropped: load(&self.messages_dropped),
            greetings_scheduled: load(&self.greetings_scheduled),
            greetings_announced: load(&self.greetings_announced),
        }
    }

    fn counters(&self) -> [&AtomicUsize; 10] {
        [
            &self.events_in,
            &self.events_duplicate,
            &self.events_dropped,
            &self.replies_requested,
            &self.batches_flushed,
            &self.messages_sent,
            &self.send_failures,
            &self.messages_dropped,
            &self.greetings_scheduled,
            &self.greetings_announced,
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub events_in: usize,
    pub events_duplicate: usize,
    pub events_dropped: usize,
    pub replies_requested: usize,
    pub batches_flushed: usize,
    pub messages_sent: usize,
    pub send_failures: usize,
    pub messages_dropped: usize,
    pub greetings_scheduled: usize,
    pub greetings_announced: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_reset() {
        let d = PipelineDiagnostics::default();
        d.events_in.fetch_add(3, Ordering::Relaxed);
        d.messages_sent.fetch_add(1, Ordering::Relaxed);
        let snap = d.snapshot();
        assert_eq!(snap.events_in, 3);
        assert_eq!(snap.messages_sent, 1);

        d.reset();
        assert_eq!(d.snapshot(), DiagnosticsSnapshot::default());
    }
}

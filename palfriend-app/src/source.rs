//! Live event source: one JSON [`LiveEvent`] per line.
//!
//! ```text
//! {"actor":{"id":"u1","nickname":"alice"},"type":"gift","giftName":"Rose","repeatCount":3}
//! {"actor":{"id":"u2","nickname":"bob"},"type":"comment","text":"hallo"}
//! ```

use palfriend_core::{EventIntake, IntakeOutcome, LiveEvent};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceStats {
    pub lines: usize,
    pub queued: usize,
    pub rejected: usize,
    pub invalid: usize,
}

/// Feed every line of `reader` into `intake` until EOF, cancellation, or
/// the pipeline shutting down.
pub async fn pump_events<R>(reader: R, intake: &EventIntake, cancel: CancellationToken) -> SourceStats
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = SourceStats::default();
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("event source reached end of input");
                break;
            }
            Err(e) => {
                warn!("event source read failed: {e}");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        stats.lines += 1;

        let event: LiveEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                stats.invalid += 1;
                warn!("skipping malformed event line: {e}");
                continue;
            }
        };
        match intake.ingest(event) {
            IntakeOutcome::Queued => stats.queued += 1,
            IntakeOutcome::Closed => {
                stats.rejected += 1;
                warn!("pipeline closed, event source stopping");
                break;
            }
            outcome => {
                stats.rejected += 1;
                debug!(?outcome, "event not queued");
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use palfriend_core::config::CompanionConfig;
    use palfriend_core::diagnostics::PipelineDiagnostics;
    use palfriend_core::viewer::ViewerTable;

    use super::*;

    #[tokio::test]
    async fn pumps_valid_lines_and_counts_the_rest() {
        let config = CompanionConfig::default();
        let (intake, mut receivers) = EventIntake::new(
            &config,
            Arc::new(ViewerTable::new()),
            Arc::new(PipelineDiagnostics::default()),
        );
        let input = concat!(
            r#"{"actor":{"id":"u1","nickname":"alice"},"type":"gift","giftName":"Rose","repeatCount":3}"#,
            "\n",
            "\n",
            "not json\n",
            r#"{"actor":{"id":"u1","nickname":"alice"},"type":"gift","giftName":"Rose","repeatCount":3}"#,
            "\n",
            r#"{"actor":{"id":"u2","nickname":"bob"},"type":"comment","text":"hallo zusammen"}"#,
            "\n",
        );

        let stats = pump_events(input.as_bytes(), &intake, CancellationToken::new()).await;
        assert_eq!(
            stats,
            SourceStats {
                lines: 4,
                queued: 2,
                rejected: 1,
                invalid: 1,
            }
        );

        let gift = receivers.gift.try_recv().expect("gift queued");
        assert_eq!(gift.actor.nickname, "alice");
        let comment = receivers.comment.try_recv().expect("comment queued");
        assert_eq!(comment.actor.id, "u2");
    }

    #[tokio::test]
    async fn cancelled_source_reads_nothing() {
        let config = CompanionConfig::default();
        let (intake, _receivers) = EventIntake::new(
            &config,
            Arc::new(ViewerTable::new()),
            Arc::new(PipelineDiagnostics::default()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let input = r#"{"actor":{"id":"u1"},"type":"follow"}"#;
        let stats = pump_events(input.as_bytes(), &intake, cancel).await;
        assert_eq!(stats.lines, 0);
    }
}

//! PalFriend host process.
//!
//! Reads live events as JSON lines from stdin, runs the companion pipeline,
//! and speaks through the configured output channel until Ctrl+C.

mod channel;
mod settings;
mod source;
mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use palfriend_core::{
    CompanionEngine, InMemoryStore, MemoryStore, OutputChannel, OutputOutcome, SpeechState,
};
use settings::{default_settings_path, load_settings, save_settings, OutputMode};
use storage::SqliteMemoryStore;
use tokio::io::BufReader;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::{ConsoleChannel, TcpOutputChannel};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("palfriend=info,palfriend_core=info")),
        )
        .init();

    info!("PalFriend starting");

    let settings_path = default_settings_path();
    let mut settings = load_settings(&settings_path);
    if !settings_path.exists() {
        if let Err(e) = save_settings(&settings_path, &settings) {
            warn!(settings_path = ?settings_path, "could not write default settings: {e}");
        }
    }
    settings.apply_env_overrides();
    info!(
        settings_path = ?settings_path,
        output_mode = ?settings.output.mode,
        output_host = %settings.output.host,
        output_port = settings.output.port,
        mic = settings.companion.mic.enabled,
        "runtime settings loaded"
    );

    // ── Output channel + memory ───────────────────────────────────────────
    let speech = Arc::new(SpeechState::new());
    let channel: Arc<dyn OutputChannel> = match settings.output.mode {
        OutputMode::Tcp => Arc::new(TcpOutputChannel::new(
            &settings.output.host,
            settings.output.port,
            settings.output.connect_attempts,
            Duration::from_millis(settings.output.retry_base_ms),
            Arc::clone(&speech),
        )),
        OutputMode::Console => Arc::new(ConsoleChannel),
    };

    let sqlite = if settings.memory.enabled {
        let db_path = settings.db_path();
        let store = SqliteMemoryStore::open(&db_path)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("failed to open memory database at {}", db_path.display()))?;
        info!(db_path = ?db_path, "viewer memory opened");
        Some(store)
    } else {
        None
    };
    let memory: Arc<dyn MemoryStore> = match &sqlite {
        Some(store) => Arc::new(store.clone()),
        None => Arc::new(InMemoryStore::new()),
    };

    // ── Engine ────────────────────────────────────────────────────────────
    let engine = CompanionEngine::new(settings.companion.clone(), channel, memory)
        .context("invalid companion configuration")?
        .with_speech_state(speech);
    let intake = engine.start().context("failed to start engine")?;
    let cancel = CancellationToken::new();

    if let Some(store) = sqlite {
        let decay_days = settings.memory.decay_days;
        let every = Duration::from_secs(settings.memory.prune_interval_secs);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => match store.prune_stale(decay_days).await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, decay_days, "stale viewers pruned"),
                        Err(e) => warn!("viewer prune failed: {e}"),
                    },
                }
            }
        });
    }

    let mut output_rx = engine.subscribe_output();
    let output_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = output_cancel.cancelled() => break,
                event = output_rx.recv() => event,
            };
            match event {
                Ok(event) if event.outcome == OutputOutcome::Dropped => {
                    warn!(attempts = event.attempts, text = %event.text, "message dropped");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("output receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── Event source ──────────────────────────────────────────────────────
    let source_cancel = cancel.clone();
    let mut source = tokio::spawn(async move {
        source::pump_events(BufReader::new(tokio::io::stdin()), &intake, source_cancel).await
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl+C")?;
            info!("shutdown requested");
        }
        stats = &mut source => {
            match stats {
                Ok(stats) => info!(?stats, "event source finished"),
                Err(e) => warn!("event source task failed: {e}"),
            }
            info!("waiting for Ctrl+C to exit");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl+C")?;
        }
    }

    cancel.cancel();
    engine.stop().context("failed to stop engine")?;
    engine.join().await;
    info!(diagnostics = ?engine.diagnostics_snapshot(), "PalFriend stopped");
    Ok(())
}

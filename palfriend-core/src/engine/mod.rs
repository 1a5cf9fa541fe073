//! `CompanionEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! CompanionEngine::new()   → config validated, status = Idle
//!     └─► start()          → PipelineContext built, workers spawned,
//!                            EventIntake returned, status = Running
//!         └─► stop()       → workers cancelled, status = Stopped
//!             └─► join()   → await worker exit
//! ```
//!
//! `start()`/`stop()` in the wrong state return an error rather than
//! panicking. `start()` must be called from within a Tokio runtime.
//!
//! ## Workers
//!
//! | Task | Kind |
//! |------|------|
//! | outbox timed flush | async |
//! | greeting announcer | async |
//! | sender | async |
//! | fan-in dispatcher | async |
//! | comment processor | async |
//! | mic capture + monitor | `spawn_blocking`, only when `mic.enabled` |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audio::AudioCapture;
use crate::buffering::create_audio_ring;
use crate::channel::OutputChannel;
use crate::config::{CompanionConfig, MicConfig};
use crate::diagnostics::{DiagnosticsSnapshot, PipelineDiagnostics};
use crate::dispatch::{CommentProcessor, EventDispatcher, NoReply, Responder};
use crate::error::{PalfriendError, Result};
use crate::greeting::GreetingScheduler;
use crate::intake::EventIntake;
use crate::ipc::events::{EngineStatus, EngineStatusEvent, MicLevelEvent, OutputEvent};
use crate::memory::MemoryStore;
use crate::mic::MicMonitor;
use crate::outbox::OutboxBatcher;
use crate::rate_limit::TokenBucket;
use crate::sender::{outbound_queue, OutboundQueue, OutputClock, OutputWorker};
use crate::speech::{ActivityGates, MicState, SpeechState};
use crate::viewer::ViewerTable;

/// Broadcast channel capacity for observer events.
const BROADCAST_CAP: usize = 256;

/// Shared state of one running session, passed explicitly to every worker.
pub struct PipelineContext {
    pub config: CompanionConfig,
    pub viewers: Arc<ViewerTable>,
    pub gates: ActivityGates,
    pub clock: Arc<OutputClock>,
    pub limiter: Arc<TokenBucket>,
    pub outbound: OutboundQueue,
    pub batcher: Arc<OutboxBatcher>,
    pub greeter: Arc<GreetingScheduler>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

struct Session {
    cancel: CancellationToken,
    context: Arc<PipelineContext>,
    tasks: Vec<JoinHandle<()>>,
}

/// The top-level engine handle. `Send + Sync`; share it behind an `Arc`.
pub struct CompanionEngine {
    config: CompanionConfig,
    channel: Arc<dyn OutputChannel>,
    memory: Arc<dyn MemoryStore>,
    responder: Arc<dyn Responder>,
    speech: Arc<SpeechState>,
    mic: Arc<MicState>,
    running: Arc<AtomicBool>,
    status: Arc<Mutex<EngineStatus>>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    output_tx: broadcast::Sender<OutputEvent>,
    level_tx: broadcast::Sender<MicLevelEvent>,
    diagnostics: Arc<PipelineDiagnostics>,
    session: Mutex<Option<Session>>,
    stopped: Mutex<Vec<JoinHandle<()>>>,
}

impl CompanionEngine {
    /// Validate `config` and create an idle engine.
    pub fn new(
        mut config: CompanionConfig,
        channel: Arc<dyn OutputChannel>,
        memory: Arc<dyn MemoryStore>,
    ) -> Result<Self> {
        config.validate()?;
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (output_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (level_tx, _) = broadcast::channel(BROADCAST_CAP);
        Ok(Self {
            config,
            channel,
            memory,
            responder: Arc::new(NoReply),
            speech: Arc::new(SpeechState::new()),
            mic: Arc::new(MicState::new()),
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            status_tx,
            output_tx,
            level_tx,
            diagnostics: Arc::new(PipelineDiagnostics::default()),
            session: Mutex::new(None),
            stopped: Mutex::new(Vec::new()),
        })
    }

    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = responder;
        self
    }

    /// Share a speech state with the output channel that reports on it.
    pub fn with_speech_state(mut self, speech: Arc<SpeechState>) -> Self {
        self.speech = speech;
        self
    }

    /// Spawn all workers and return the intake handle for the event source.
    ///
    /// # Errors
    /// - `PalfriendError::AlreadyRunning` if already started.
    pub fn start(&self) -> Result<EventIntake> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PalfriendError::AlreadyRunning);
        }
        self.diagnostics.reset();

        let config = self.config.clone();
        let diagnostics = Arc::clone(&self.diagnostics);
        let gates = ActivityGates::new(Arc::clone(&self.speech), Arc::clone(&self.mic));
        let viewers = Arc::new(ViewerTable::new());
        let clock = Arc::new(OutputClock::new());
        let (outbound, outbound_rx) = outbound_queue(config.sender.max_line_length);
        let batcher = Arc::new(OutboxBatcher::new(
            config.outbox.clone(),
            Arc::new(outbound.clone()),
            gates.clone(),
            Arc::clone(&diagnostics),
        ));
        let greeter = Arc::new(GreetingScheduler::new(
            config.greeting.clone(),
            Arc::clone(&viewers),
            Arc::clone(&self.memory),
            Arc::clone(&batcher),
            gates.clone(),
            Arc::clone(&clock),
            Arc::clone(&diagnostics),
        ));
        let context = Arc::new(PipelineContext {
            limiter: Arc::new(TokenBucket::from_config(&config.rate_limit)),
            config,
            viewers: Arc::clone(&viewers),
            gates,
            clock,
            outbound,
            batcher,
            greeter,
            diagnostics,
        });

        let (intake, receivers) =
            EventIntake::new(&context.config, viewers, Arc::clone(&context.diagnostics));
        let (comments, fan_in) = receivers.split();

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(
            Arc::clone(&context.batcher).run(cancel.child_token()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&context.greeter).run_announcer(cancel.child_token()),
        ));
        let sender = OutputWorker::new(
            &context.config,
            Arc::clone(&self.channel),
            Arc::clone(&self.speech),
            Arc::clone(&context.clock),
            outbound_rx,
            Arc::clone(&context.diagnostics),
            self.output_tx.clone(),
        );
        tasks.push(tokio::spawn(sender.run(cancel.child_token())));
        let dispatcher = EventDispatcher::new(
            &context.config,
            fan_in,
            Arc::clone(&context.batcher),
            Arc::clone(&context.greeter),
            Arc::clone(&self.memory),
        );
        tasks.push(tokio::spawn(dispatcher.run(cancel.child_token())));
        let comments = CommentProcessor::new(
            &context.config,
            comments,
            Arc::clone(&context.limiter),
            Arc::clone(&context.batcher),
            Arc::clone(&self.memory),
            Arc::clone(&self.responder),
            Arc::clone(&context.diagnostics),
        );
        tasks.push(tokio::spawn(comments.run(cancel.child_token())));

        let mic_config = context.config.mic.clone();
        *self.session.lock() = Some(Session {
            cancel,
            context,
            tasks,
        });
        self.set_status(EngineStatus::Running, None);
        if mic_config.enabled {
            self.spawn_mic_monitor(mic_config);
        }
        info!("engine started");
        Ok(intake)
    }

    /// Cancel every worker and pending greet task.
    ///
    /// # Errors
    /// - `PalfriendError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(PalfriendError::NotRunning);
        }
        if let Some(session) = self.session.lock().take() {
            session.cancel.cancel();
            session.context.greeter.cancel_pending();
            self.stopped.lock().extend(session.tasks);
        }
        self.set_status(EngineStatus::Stopped, None);
        info!("engine stop requested");
        Ok(())
    }

    /// Wait for the workers of stopped sessions to exit.
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.stopped.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("worker task ended abnormally: {e}");
            }
        }
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shared state of the running session, if any.
    pub fn context(&self) -> Option<Arc<PipelineContext>> {
        self.session
            .lock()
            .as_ref()
            .map(|s| Arc::clone(&s.context))
    }

    pub fn speech(&self) -> &Arc<SpeechState> {
        &self.speech
    }

    pub fn mic(&self) -> &Arc<MicState> {
        &self.mic
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputEvent> {
        self.output_tx.subscribe()
    }

    pub fn subscribe_mic_levels(&self) -> broadcast::Receiver<MicLevelEvent> {
        self.level_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    /// Capture failure leaves the engine running without the mic gate and is
    /// reported as a `Running` status carrying the reason.
    fn spawn_mic_monitor(&self, mic_config: MicConfig) {
        let status_tx = self.status_tx.clone();
        let running = Arc::clone(&self.running);
        let mic = Arc::clone(&self.mic);
        let levels = self.level_tx.clone();

        tokio::task::spawn_blocking(move || {
            let (producer, consumer) = create_audio_ring();
            // Opened on this thread: cpal::Stream is !Send.
            let capture = match AudioCapture::open(producer, Arc::clone(&running), &mic_config.device) {
                Ok(capture) => capture,
                Err(e) => {
                    warn!("mic gate disabled: {e}");
                    let _ = status_tx.send(EngineStatusEvent {
                        status: EngineStatus::Running,
                        detail: Some(format!("mic gate disabled: {e}")),
                    });
                    return;
                }
            };
            info!(sample_rate = capture.sample_rate, "mic monitor running");
            MicMonitor::new(&mic_config, consumer, capture.sample_rate, mic, levels).run(running);
            capture.stop();
        });
    }

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(EngineStatusEvent {
            status: new_status,
            detail,
        });
    }
}

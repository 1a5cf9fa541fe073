use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use palfriend_core::{
    Actor, ChannelError, CompanionConfig, CompanionEngine, InMemoryStore, IntakeOutcome,
    LiveEvent, MemoryStore, OutputChannel, OutputOutcome,
};
use parking_lot::Mutex;

#[derive(Default)]
struct CollectingChannel {
    lines: Mutex<Vec<String>>,
}

impl CollectingChannel {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

#[async_trait]
impl OutputChannel for CollectingChannel {
    async fn send(&self, payload: &str) -> Result<(), ChannelError> {
        self.lines.lock().push(payload.to_string());
        Ok(())
    }
}

fn quiet_config() -> CompanionConfig {
    let mut config = CompanionConfig::default();
    config.mic.enabled = false;
    config.speech.await_signals = false;
    config
}

fn start(config: CompanionConfig) -> (CompanionEngine, Arc<CollectingChannel>, Arc<InMemoryStore>) {
    let channel = Arc::new(CollectingChannel::default());
    let memory = Arc::new(InMemoryStore::new());
    let engine = CompanionEngine::new(
        config,
        Arc::clone(&channel) as Arc<dyn OutputChannel>,
        Arc::clone(&memory) as Arc<dyn MemoryStore>,
    )
    .expect("valid config");
    (engine, channel, memory)
}

#[tokio::test(start_paused = true)]
async fn join_is_announced_after_greeting_delay() {
    let (engine, channel, memory) = start(quiet_config());
    let intake = engine.start().expect("start");

    assert_eq!(
        intake.ingest(LiveEvent::join(Actor::new("u1", "u1"))),
        IntakeOutcome::Queued
    );

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(channel.lines().is_empty(), "announced before the greeting delay");

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(channel.lines(), vec!["Neu dabei: u1".to_string()]);
    assert!(memory
        .get_viewer_cooldown("u1")
        .await
        .expect("memory")
        .is_some());

    let stats = engine.diagnostics_snapshot();
    assert_eq!(stats.greetings_scheduled, 1);
    assert_eq!(stats.greetings_announced, 1);
    assert_eq!(stats.messages_sent, 1);

    engine.stop().expect("stop");
    engine.join().await;
}

#[tokio::test(start_paused = true)]
async fn events_are_batched_by_priority_into_one_line() {
    let (engine, channel, _memory) = start(quiet_config());
    let mut outputs = engine.subscribe_output();
    let intake = engine.start().expect("start");

    let gift = LiveEvent::gift(Actor::new("a1", "alice"), "Rose", 5);
    assert_eq!(intake.ingest(gift.clone()), IntakeOutcome::Queued);
    assert_eq!(intake.ingest(gift), IntakeOutcome::Duplicate);
    assert_eq!(
        intake.ingest(LiveEvent::new(
            Actor::new("b1", "bob"),
            palfriend_core::EventPayload::Follow
        )),
        IntakeOutcome::Queued
    );

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(
        channel.lines(),
        vec!["alice sent Rose x5 • bob followed".to_string()]
    );

    let event = outputs.recv().await.expect("output event");
    assert_eq!(event.outcome, OutputOutcome::Sent);
    assert_eq!(event.attempts, 1);

    let stats = engine.diagnostics_snapshot();
    assert_eq!(stats.events_duplicate, 1);
    assert_eq!(stats.batches_flushed, 1);

    engine.stop().expect("stop");
    engine.join().await;
}

#[tokio::test(start_paused = true)]
async fn speaking_companion_holds_back_output() {
    let (engine, channel, _memory) = start(quiet_config());
    let intake = engine.start().expect("start");

    engine.speech().mark_started();
    intake.ingest(LiveEvent::new(
        Actor::new("s1", "sam"),
        palfriend_core::EventPayload::Subscribe,
    ));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(channel.lines().is_empty());

    engine.speech().mark_ended();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(channel.lines(), vec!["sam subscribed".to_string()]);

    engine.stop().expect("stop");
    engine.join().await;
}

#[tokio::test(start_paused = true)]
async fn stopped_engine_rejects_new_events() {
    let (engine, _channel, _memory) = start(quiet_config());
    let intake = engine.start().expect("start");
    engine.stop().expect("stop");
    engine.join().await;

    let outcome = intake.ingest(LiveEvent::gift(Actor::new("a1", "alice"), "Rose", 1));
    assert_eq!(outcome, IntakeOutcome::Closed);
}

//! Output channels: the avatar host over TCP, or stdout.
//!
//! ## Wire format (TCP, one JSON object per line)
//!
//! ```text
//! → {"action":"ChatbotSendMessage","id":"<nanos>","message":"...","priority":1}
//! ← {"action":"ChatbotSpeechStarted"}
//! ← {"action":"ChatbotSpeechEnded"}
//! ```
//!
//! Incoming speech notifications drive the shared [`SpeechState`]. A dropped
//! connection counts as speech ended so the sender never waits forever.
//! Every connection gets a generation number; a reader left over from a
//! replaced connection neither touches speech state nor clears the live one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use palfriend_core::{ChannelError, OutputChannel, SpeechState};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct SendMessage<'a> {
    action: &'static str,
    id: String,
    message: &'a str,
    priority: u8,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct HostMessage {
    action: Option<String>,
    event: Option<String>,
}

struct HostConnection {
    generation: u64,
    writer: OwnedWriteHalf,
}

pub struct TcpOutputChannel {
    addr: String,
    connect_attempts: u32,
    retry_base: Duration,
    speech: Arc<SpeechState>,
    writer: Mutex<Option<HostConnection>>,
    /// Generation of the live connection, 0 when there is none.
    live: Arc<AtomicU64>,
    next_generation: AtomicU64,
}

impl TcpOutputChannel {
    pub fn new(
        host: &str,
        port: u16,
        connect_attempts: u32,
        retry_base: Duration,
        speech: Arc<SpeechState>,
    ) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            connect_attempts: connect_attempts.max(1),
            retry_base,
            speech,
            writer: Mutex::new(None),
            live: Arc::new(AtomicU64::new(0)),
            next_generation: AtomicU64::new(1),
        }
    }

    async fn connect(&self) -> Result<HostConnection, ChannelError> {
        let mut last_error = None;
        for attempt in 0..self.connect_attempts {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
                    info!(addr = %self.addr, generation, "connected to output host");
                    let (read, writer) = stream.into_split();
                    self.live.store(generation, Ordering::SeqCst);
                    tokio::spawn(read_host_messages(
                        read,
                        generation,
                        Arc::clone(&self.speech),
                        Arc::clone(&self.live),
                    ));
                    return Ok(HostConnection { generation, writer });
                }
                Err(e) => {
                    warn!(addr = %self.addr, attempt = attempt + 1, "output host connect failed: {e}");
                    last_error = Some(e);
                    if attempt + 1 < self.connect_attempts {
                        tokio::time::sleep(self.retry_base.saturating_mul(1 << attempt.min(16))).await;
                    }
                }
            }
        }
        Err(match last_error {
            Some(e) => ChannelError::Io(e),
            None => ChannelError::Unavailable(self.addr.clone()),
        })
    }
}

#[async_trait]
impl OutputChannel for TcpOutputChannel {
    async fn send(&self, payload: &str) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        let live = self.live.load(Ordering::SeqCst);
        if writer.as_ref().is_some_and(|conn| conn.generation != live) {
            *writer = None;
        }
        if writer.is_none() {
            *writer = Some(self.connect().await?);
        }
        let Some(conn) = writer.as_mut() else {
            return Err(ChannelError::Unavailable(self.addr.clone()));
        };

        let message = SendMessage {
            action: "ChatbotSendMessage",
            id: Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string(),
            message: payload,
            priority: 1,
        };
        let mut line =
            serde_json::to_string(&message).map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        line.push('\n');

        if let Err(e) = conn.writer.write_all(line.as_bytes()).await {
            let generation = conn.generation;
            *writer = None;
            let _ = self
                .live
                .compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst);
            return Err(ChannelError::Io(e));
        }
        info!(message = %payload, "sent to output host");
        Ok(())
    }

    fn name(&self) -> &str {
        "tcp"
    }
}

async fn read_host_messages(
    read: OwnedReadHalf,
    generation: u64,
    speech: Arc<SpeechState>,
    live: Arc<AtomicU64>,
) {
    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(_)) if live.load(Ordering::SeqCst) != generation => {
                debug!(generation, "ignoring message on replaced connection");
            }
            Ok(Some(line)) => {
                let Ok(message) = serde_json::from_str::<HostMessage>(&line) else {
                    continue;
                };
                match message.action.or(message.event).as_deref() {
                    Some("ChatbotSpeechStarted") => {
                        speech.mark_started();
                    }
                    Some("ChatbotSpeechEnded") => {
                        speech.mark_ended();
                    }
                    _ => debug!(line = %line, "output host message"),
                }
            }
            Ok(None) => {
                warn!("output host closed the connection");
                break;
            }
            Err(e) => {
                warn!("output host connection lost: {e}");
                break;
            }
        }
    }
    if live
        .compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        speech.mark_ended();
    }
}

/// Prints every line to stdout. Speech is never reported, so the sender
/// relies on its start timeout between lines.
#[derive(Debug, Default)]
pub struct ConsoleChannel;

#[async_trait]
impl OutputChannel for ConsoleChannel {
    async fn send(&self, payload: &str) -> Result<(), ChannelError> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(payload.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn sends_json_lines_and_tracks_speech() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let speech = Arc::new(SpeechState::new());
        let channel = TcpOutputChannel::new(
            "127.0.0.1",
            port,
            1,
            Duration::from_millis(10),
            Arc::clone(&speech),
        );

        let (hang_up, hung_up) = tokio::sync::oneshot::channel::<()>();
        let (line_tx, line_rx) = tokio::sync::oneshot::channel::<String>();
        let host = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let line = lines.next_line().await.expect("read").expect("line");
            let _ = line_tx.send(line);
            write
                .write_all(b"{\"action\":\"ChatbotSpeechStarted\"}\n")
                .await
                .expect("write");
            let _ = hung_up.await;
        });

        channel.send("hallo chat").await.expect("send");
        let line = line_rx.await.expect("host line");
        let value: serde_json::Value = serde_json::from_str(&line).expect("json");
        assert_eq!(value["action"], "ChatbotSendMessage");
        assert_eq!(value["message"], "hallo chat");
        assert_eq!(value["priority"], 1);

        assert!(speech.wait_started(Duration::from_secs(2)).await);
        assert!(speech.is_speaking());

        // Dropping the connection counts as speech ended.
        let _ = hang_up.send(());
        host.await.expect("host task");
        assert!(speech.wait_ended(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn unreachable_host_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let channel = TcpOutputChannel::new(
            "127.0.0.1",
            port,
            2,
            Duration::from_millis(5),
            Arc::new(SpeechState::new()),
        );
        assert!(channel.send("x").await.is_err());
    }

    #[tokio::test]
    async fn replaced_connection_reader_leaves_state_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (host_side, _) = listener.accept().await.expect("accept");

        let speech = Arc::new(SpeechState::new());
        speech.mark_started();
        // Generation 2 is live; this reader belongs to generation 1.
        let live = Arc::new(AtomicU64::new(2));
        let (read, _write) = client.into_split();
        let reader = tokio::spawn(read_host_messages(
            read,
            1,
            Arc::clone(&speech),
            Arc::clone(&live),
        ));

        let (_, mut host_write) = host_side.into_split();
        host_write
            .write_all(b"{\"action\":\"ChatbotSpeechEnded\"}\n")
            .await
            .expect("write");
        drop(host_write);
        reader.await.expect("reader task");

        assert_eq!(live.load(Ordering::SeqCst), 2);
        assert!(speech.is_speaking());
    }
}

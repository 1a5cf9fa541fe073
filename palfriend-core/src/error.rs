use thiserror::Error;

/// All errors produced by palfriend-core.
#[derive(Debug, Error)]
pub enum PalfriendError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("outbound queue is closed: sender worker has stopped")]
    QueueClosed,

    #[error("output channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("memory store error: {0}")]
    Memory(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures reported by an [`OutputChannel`](crate::channel::OutputChannel).
///
/// Every variant is treated as transient by the sender: the message is
/// re-queued until its attempt budget is spent.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("output channel unavailable: {0}")]
    Unavailable(String),

    #[error("output channel send failed: {0}")]
    SendFailed(String),

    #[error("output channel IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PalfriendError>;

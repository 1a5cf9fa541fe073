//! Output Channel boundary.
//!
//! An implementation delivers one text payload to the speech/avatar host. A
//! channel that can observe the host's speech activity reports it through
//! the [`SpeechState`](crate::speech::SpeechState) handed to it at
//! construction; the sender only ever calls [`OutputChannel::send`].

use async_trait::async_trait;

use crate::error::ChannelError;

#[async_trait]
pub trait OutputChannel: Send + Sync + 'static {
    async fn send(&self, payload: &str) -> Result<(), ChannelError>;

    /// Short name used in logs.
    fn name(&self) -> &str {
        "output"
    }
}

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::RpcTransportError;

/// A duplex text channel.
///
/// `shutdown` is shared by both ends: cancelling it tears down the whole
/// connection, and transports cancel it when the underlying stream ends.
#[derive(Debug)]
pub struct Channel {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
    pub shutdown: CancellationToken,
}

impl Channel {
    /// Two in-memory channel ends wired to each other.
    pub fn pair(buffer: usize) -> (Channel, Channel) {
        let (a_tx, a_rx) = mpsc::channel(buffer);
        let (b_tx, b_rx) = mpsc::channel(buffer);
        let shutdown = CancellationToken::new();
        (
            Channel {
                outgoing: a_tx,
                incoming: b_rx,
                shutdown: shutdown.clone(),
            },
            Channel {
                outgoing: b_tx,
                incoming: a_rx,
                shutdown,
            },
        )
    }
}

/// Opens a [`Channel`] to a service endpoint.
///
/// Connections take the opener as a value, so live, recorded or in-memory
/// transports can be chosen per connection.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Channel, RpcTransportError>;
}

/// Hands out a single pre-built channel, ignoring the requested url.
#[derive(Debug)]
pub struct MemoryOpener {
    channel: Mutex<Option<Channel>>,
}

impl MemoryOpener {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel: Mutex::new(Some(channel)),
        }
    }
}

#[async_trait]
impl ChannelOpener for MemoryOpener {
    async fn open(&self, url: &Url) -> Result<Channel, RpcTransportError> {
        self.channel.lock().take().ok_or_else(|| RpcTransportError::Io {
            message: format!("in-memory channel for {url} was already opened"),
        })
    }
}

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

use crate::channel::{Channel, ChannelOpener};
use crate::error::RpcTransportError;

/// Opens channels over a WebSocket connection.
#[derive(Debug, Clone)]
pub struct WebSocketOpener {
    pub buffer: usize,
}

impl Default for WebSocketOpener {
    fn default() -> Self {
        Self { buffer: 256 }
    }
}

#[async_trait]
impl ChannelOpener for WebSocketOpener {
    async fn open(&self, url: &Url) -> Result<Channel, RpcTransportError> {
        let (stream, _response) =
            connect_async(url.as_str())
                .await
                .map_err(|err| RpcTransportError::Io {
                    message: format!("failed to connect to {url}: {err}"),
                })?;
        let (mut sink, mut source) = stream.split();

        let (local, remote) = Channel::pair(self.buffer.max(1));
        let Channel {
            outgoing,
            mut incoming,
            shutdown,
        } = remote;

        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let text = tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    next = incoming.recv() => match next {
                        Some(text) => text,
                        None => break,
                    },
                };
                if let Err(err) = sink.send(WsMessage::Text(text.into())).await {
                    tracing::debug!(target: "tether.rpc", error = %err, "websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
            writer_shutdown.cancel();
        });

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    frame = source.next() => frame,
                };
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!(target: "tether.rpc", "dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        tracing::debug!(target: "tether.rpc", error = %err, "websocket read failed");
                        break;
                    }
                };
                if outgoing.send(text).await.is_err() {
                    break;
                }
            }
            shutdown.cancel();
        });

        Ok(local)
    }
}

//! A JSON-RPC 2.0 peer over a duplex text [`Channel`].
//!
//! Both sides of the connection may issue requests: outgoing requests are
//! correlated with their responses by id, and inbound requests and
//! notifications are dispatched to handlers registered with
//! [`Peer::register_method`].

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

mod channel;
mod error;
mod message;
mod websocket;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use channel::{Channel, ChannelOpener, MemoryOpener};
pub use error::{codes, RpcError, RpcErrorObject, RpcTransportError};
pub use message::Message;
pub use websocket::WebSocketOpener;

pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Value, RpcErrorObject>> + Send>>;
pub type MethodHandler = Arc<dyn Fn(Value) -> MethodFuture + Send + Sync>;

type PendingReply = oneshot::Sender<Result<Value, RpcErrorObject>>;

struct Inner {
    outgoing: mpsc::Sender<String>,
    pending: Mutex<HashMap<u64, PendingReply>>,
    methods: RwLock<HashMap<String, MethodHandler>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    closed_reason: Mutex<Option<RpcTransportError>>,
}

impl Inner {
    fn close_reason(&self) -> RpcTransportError {
        self.closed_reason
            .lock()
            .clone()
            .unwrap_or(RpcTransportError::ConnectionClosed)
    }

    fn handler(&self, method: &str) -> Option<MethodHandler> {
        self.methods.read().get(method).cloned()
    }
}

/// Removes the pending entry if the awaiting request is dropped or fails.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.id);
    }
}

#[derive(Clone)]
pub struct Peer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Peer {
    /// Starts serving `channel`. Must be called from within a Tokio runtime.
    pub fn start(channel: Channel) -> Self {
        let Channel {
            outgoing,
            incoming,
            shutdown,
        } = channel;

        let inner = Arc::new(Inner {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            methods: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
            closed_reason: Mutex::new(None),
        });

        tokio::spawn(read_loop(incoming, inner.clone()));

        Self { inner }
    }

    /// Registers a handler for an inbound method.
    ///
    /// The same handler serves requests and notifications. Notification
    /// handlers run on the read loop, one at a time and in arrival order, so
    /// they must not wait for responses from this peer. Request handlers run
    /// on their own task.
    pub fn register_method<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcErrorObject>> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.inner.methods.write().insert(method.into(), handler);
    }

    /// Sends a request and waits for its response until the connection closes.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.call(method, params, None).await
    }

    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.call(method, params, Some(timeout)).await
    }

    pub async fn send_notification(&self, method: &str, params: Value) -> Result<(), RpcError> {
        let text = Message::Notification {
            method: method.to_owned(),
            params,
        }
        .to_text();
        tracing::trace!(target: "tether.rpc", method, "-> notification");
        self.write(text).await
    }

    /// A token that is cancelled when the connection closes, either explicitly
    /// via [`Peer::close`] or because the transport went away.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Transport(self.inner.close_reason()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            inner: &self.inner,
            id,
        };

        let text = Message::Request {
            id: Value::from(id),
            method: method.to_owned(),
            params,
        }
        .to_text();
        tracing::trace!(target: "tether.rpc", id, method, "-> request");
        self.write(text).await?;

        let reply = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, rx)
                    .await
                    .map_err(|_elapsed| RpcError::Timeout(limit)),
                None => Ok(rx.await),
            }
        };

        let reply = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                return Err(RpcError::Transport(self.inner.close_reason()));
            }
            reply = reply => reply?,
        };

        match reply {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(RpcError::Remote(error)),
            Err(_closed) => Err(RpcError::Transport(self.inner.close_reason())),
        }
    }

    async fn write(&self, text: String) -> Result<(), RpcError> {
        self.inner
            .outgoing
            .send(text)
            .await
            .map_err(|_| RpcError::Transport(RpcTransportError::ConnectionClosed))
    }
}

async fn read_loop(mut incoming: mpsc::Receiver<String>, inner: Arc<Inner>) {
    loop {
        let text = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            next = incoming.recv() => match next {
                Some(text) => text,
                None => break,
            },
        };
        tracing::trace!(target: "tether.rpc", message = %text, "<- received");

        match Message::parse(&text) {
            Ok(Message::Response { id, result }) => {
                let tx = response_id(&id).and_then(|id| inner.pending.lock().remove(&id));
                match tx {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => {
                        tracing::debug!(target: "tether.rpc", %id, "response for unknown request");
                    }
                }
            }
            Ok(Message::Notification { method, params }) => match inner.handler(&method) {
                Some(handler) => {
                    if let Err(err) = handler(params).await {
                        tracing::debug!(
                            target: "tether.rpc",
                            method = %method,
                            code = err.code,
                            error = %err.message,
                            "notification handler failed"
                        );
                    }
                }
                None => {
                    tracing::trace!(target: "tether.rpc", method = %method, "unhandled notification");
                }
            },
            Ok(Message::Request { id, method, params }) => {
                tokio::spawn(handle_request(inner.clone(), id, method, params));
            }
            Err(err) => {
                tracing::warn!(target: "tether.rpc", error = %err, "dropping malformed message");
            }
        }
    }

    {
        let mut reason = inner.closed_reason.lock();
        if reason.is_none() {
            *reason = Some(RpcTransportError::ConnectionClosed);
        }
    }
    inner.shutdown.cancel();

    // Dropping the senders fails every outstanding request.
    let pending = std::mem::take(&mut *inner.pending.lock());
    drop(pending);
    tracing::debug!(target: "tether.rpc", "connection closed");
}

async fn handle_request(inner: Arc<Inner>, id: Value, method: String, params: Value) {
    let result = match inner.handler(&method) {
        Some(handler) => handler(params).await,
        None => Err(RpcErrorObject::method_not_found(&method)),
    };
    let text = Message::Response { id, result }.to_text();
    if inner.outgoing.send(text).await.is_err() {
        tracing::debug!(target: "tether.rpc", method = %method, "could not answer request; connection closed");
    }
}

fn response_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

//! A scripted JSON-RPC peer used by tests to stand in for a VM service.
//!
//! Replies are produced by per-method closures; every call is recorded so
//! tests can assert on how often, and with which parameters, a method was hit.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::{Channel, MemoryOpener, Peer, RpcError, RpcErrorObject};

#[derive(Default)]
struct State {
    calls: Mutex<Vec<(String, Value)>>,
}

pub struct MockPeer {
    peer: Peer,
    state: Arc<State>,
}

impl MockPeer {
    /// Starts a mock peer and returns it with the client end of its channel.
    pub fn new() -> (Self, Channel) {
        let (client, server) = Channel::pair(64);
        let mock = Self {
            peer: Peer::start(server),
            state: Arc::new(State::default()),
        };
        (mock, client)
    }

    /// Like [`MockPeer::new`], with the client end wrapped in an opener.
    pub fn with_opener() -> (Self, MemoryOpener) {
        let (mock, client) = Self::new();
        (mock, MemoryOpener::new(client))
    }

    /// Answers `method` with a fixed result.
    pub fn reply(&self, method: &str, result: Value) {
        self.handle(method, move |_| Ok(result.clone()));
    }

    pub fn handle<F>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Result<Value, RpcErrorObject> + Send + Sync + 'static,
    {
        self.handle_with_delay(method, Duration::ZERO, handler);
    }

    /// Answers `method` after `delay`. Other requests are served meanwhile.
    pub fn handle_with_delay<F>(&self, method: &str, delay: Duration, handler: F)
    where
        F: Fn(Value) -> Result<Value, RpcErrorObject> + Send + Sync + 'static,
    {
        let state = self.state.clone();
        let name = method.to_owned();
        let handler = Arc::new(handler);
        self.peer.register_method(method, move |params: Value| {
            state.calls.lock().push((name.clone(), params.clone()));
            let handler = handler.clone();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                handler(params)
            }
        });
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|(name, _)| name == method)
            .count()
    }

    /// Parameters of every recorded call to `method`, oldest first.
    pub fn calls(&self, method: &str) -> Vec<Value> {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|(name, _)| name == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    /// Pushes a `streamNotify` notification to the client.
    pub async fn send_event(&self, stream_id: &str, event: Value) {
        let _ = self
            .peer
            .send_notification(
                "streamNotify",
                json!({ "streamId": stream_id, "event": event }),
            )
            .await;
    }

    /// Calls a method the client registered.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.peer.send_request(method, params).await
    }

    pub fn close(&self) {
        self.peer.close();
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}

impl std::fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let calls: HashMap<String, usize> =
            self.state
                .calls
                .lock()
                .iter()
                .fold(HashMap::new(), |mut acc, (name, _)| {
                    *acc.entry(name.clone()).or_default() += 1;
                    acc
                });
        f.debug_struct("MockPeer").field("calls", &calls).finish()
    }
}

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use async_trait::async_trait;
use tether_rpc::{mock::MockPeer, Channel, ChannelOpener, MemoryOpener, RpcTransportError};
use tether_vm::{ConnectOptions, VmService, VmServiceError};
use url::Url;

use crate::harness::{scripted, spawn_service, test_config, HTTP_URI};

/// Refuses the first `failures` attempts.
struct FlakyOpener {
    failures: AtomicU32,
    attempts: AtomicU32,
    inner: MemoryOpener,
}

#[async_trait]
impl ChannelOpener for FlakyOpener {
    async fn open(&self, url: &Url) -> Result<Channel, RpcTransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RpcTransportError::Io {
                message: "connection refused".to_owned(),
            });
        }
        self.inner.open(url).await
    }
}

fn flaky(failures: u32) -> (MockPeer, Arc<FlakyOpener>) {
    let (mock, inner) = MockPeer::with_opener();
    let (mock, _, _) = scripted(mock);
    let opener = Arc::new(FlakyOpener {
        failures: AtomicU32::new(failures),
        attempts: AtomicU32::new(0),
        inner,
    });
    (mock, opener)
}

fn options() -> ConnectOptions {
    ConnectOptions {
        config: test_config(),
        reload_sources: None,
    }
}

#[tokio::test]
async fn connects_to_the_websocket_endpoint() {
    let vm = spawn_service().await;
    assert_eq!(vm.service.http_uri().as_str(), HTTP_URI);
    assert_eq!(vm.service.ws_uri().as_str(), "ws://127.0.0.1:8181/ws");
    assert_eq!(vm.mock.call_count("getVersion"), 1);
    assert!(!vm.service.is_closed());
}

#[tokio::test]
async fn refused_connections_are_retried() {
    let (mock, opener) = flaky(2);
    let uri = Url::parse(HTTP_URI).unwrap();

    let service = VmService::connect(&uri, opener.clone(), options())
        .await
        .unwrap();
    assert_eq!(opener.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(mock.call_count("getVersion"), 1);
    service.close();
}

#[tokio::test]
async fn retries_are_bounded() {
    let (_mock, opener) = flaky(10);
    let uri = Url::parse(HTTP_URI).unwrap();

    let err = VmService::connect(&uri, opener.clone(), options())
        .await
        .unwrap_err();
    assert!(matches!(err, VmServiceError::Handshake { .. }), "{err:?}");
    assert_eq!(opener.attempts.load(Ordering::SeqCst), test_config().connect_attempts);
}

#[tokio::test]
async fn a_failed_handshake_closes_the_connection() {
    // No `getVersion` handler: the VM answers method-not-found.
    let (mock, opener) = MockPeer::with_opener();
    let uri = Url::parse(HTTP_URI).unwrap();

    let err = VmService::connect(&uri, Arc::new(opener), options())
        .await
        .unwrap_err();
    match err {
        VmServiceError::Handshake { uri, .. } => assert_eq!(uri, "ws://127.0.0.1:8181/ws"),
        other => panic!("expected a handshake failure, got {other:?}"),
    }
    mock.peer().closed().await;
}

#[tokio::test]
async fn unsupported_schemes_are_rejected_before_connecting() {
    let (_mock, opener) = flaky(0);
    let uri = Url::parse("ftp://127.0.0.1:8181/").unwrap();

    let err = VmService::connect(&uri, opener.clone(), options())
        .await
        .unwrap_err();
    assert!(matches!(err, VmServiceError::Handshake { .. }), "{err:?}");
    assert_eq!(opener.attempts.load(Ordering::SeqCst), 0);
}

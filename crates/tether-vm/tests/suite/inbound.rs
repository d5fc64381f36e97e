use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tether_rpc::{codes, RpcError};
use tether_vm::{ConnectOptions, ReloadSourcesHandler, VmServiceError};

use crate::harness::{spawn_service_with, test_config, TestVm};

#[derive(Default)]
struct RecordingReloader {
    requests: Mutex<Vec<(String, bool, bool)>>,
    fail_with: Mutex<Option<VmServiceError>>,
}

#[async_trait]
impl ReloadSourcesHandler for RecordingReloader {
    async fn reload_sources(
        &self,
        isolate_id: &str,
        force: bool,
        pause: bool,
    ) -> tether_vm::Result<()> {
        self.requests
            .lock()
            .push((isolate_id.to_owned(), force, pause));
        match self.fail_with.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn serving(reloader: Arc<RecordingReloader>) -> TestVm {
    spawn_service_with(ConnectOptions {
        config: test_config(),
        reload_sources: Some(reloader),
    })
    .await
}

fn remote(result: Result<serde_json::Value, RpcError>) -> tether_rpc::RpcErrorObject {
    match result {
        Err(RpcError::Remote(err)) => err,
        other => panic!("expected an error response, got {other:?}"),
    }
}

#[tokio::test]
async fn the_service_is_announced_on_connect() {
    let vm = serving(Arc::default()).await;

    let registered = vm.mock.calls("_registerService");
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0]["service"], "reloadSources");
    assert_eq!(registered[0]["alias"], test_config().client_alias);
}

#[tokio::test]
async fn nothing_is_announced_without_a_handler() {
    let vm = crate::harness::spawn_service().await;
    assert_eq!(vm.mock.call_count("_registerService"), 0);

    let err = remote(vm.mock.request("reloadSources", json!({"isolateId": "isolates/1"})).await);
    assert_eq!(err.code, codes::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn a_valid_request_reaches_the_handler() {
    let reloader = Arc::new(RecordingReloader::default());
    let vm = serving(reloader.clone()).await;

    let reply = vm
        .mock
        .request(
            "reloadSources",
            json!({"isolateId": "isolates/1", "force": true}),
        )
        .await
        .unwrap();
    assert_eq!(reply, json!({"type": "Success"}));
    assert_eq!(
        *reloader.requests.lock(),
        [("isolates/1".to_owned(), true, false)]
    );
}

#[tokio::test]
async fn malformed_parameters_are_rejected() {
    let reloader = Arc::new(RecordingReloader::default());
    let vm = serving(reloader.clone()).await;

    for params in [
        json!({}),
        json!({"isolateId": ""}),
        json!({"isolateId": 7}),
        json!({"isolateId": "isolates/1", "force": "yes"}),
        json!({"isolateId": "isolates/1", "pause": 1}),
    ] {
        let err = remote(vm.mock.request("reloadSources", params.clone()).await);
        assert_eq!(err.code, codes::INVALID_PARAMS, "{params}");
    }
    assert!(reloader.requests.lock().is_empty());
}

#[tokio::test]
async fn application_errors_pass_through() {
    let reloader = Arc::new(RecordingReloader::default());
    *reloader.fail_with.lock() = Some(VmServiceError::Application {
        method: "_reloadSources".to_owned(),
        code: tether_vm::RELOAD_BARRED,
        message: "isolate is not reloadable".to_owned(),
        data: Some(json!({"reason": "paused"})),
    });
    let vm = serving(reloader).await;

    let err = remote(
        vm.mock
            .request("reloadSources", json!({"isolateId": "isolates/1"}))
            .await,
    );
    assert_eq!(err.code, tether_vm::RELOAD_BARRED);
    assert_eq!(err.message, "isolate is not reloadable");
    assert_eq!(err.data, Some(json!({"reason": "paused"})));
}

#[tokio::test]
async fn other_failures_become_server_errors() {
    let reloader = Arc::new(RecordingReloader::default());
    *reloader.fail_with.lock() = Some(VmServiceError::Load("compile failed".to_owned()));
    let vm = serving(reloader).await;

    let err = remote(
        vm.mock
            .request("reloadSources", json!({"isolateId": "isolates/1", "pause": true}))
            .await,
    );
    assert_eq!(err.code, codes::SERVER_ERROR);
    assert!(
        err.message.starts_with("Error during Sources Reload: "),
        "{}",
        err.message
    );
    assert!(err.message.contains("compile failed"), "{}", err.message);
}

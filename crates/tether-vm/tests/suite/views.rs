use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tether_config::ServiceConfig;
use tether_vm::{streams, ConnectOptions};
use url::Url;

use crate::harness::{spawn_service, spawn_service_with, test_config, wait_until, within, TestVm};

fn view_list(ids: &[&str], isolate_id: &str) -> Value {
    let views: Vec<Value> = ids
        .iter()
        .map(|id| {
            json!({
                "type": "FlutterView",
                "id": id,
                "isolate": {"type": "@Isolate", "id": isolate_id, "name": "main"},
            })
        })
        .collect();
    json!({"type": "FlutterViewList", "views": views})
}

async fn with_views(vm: &TestVm) {
    vm.add_isolate("isolates/1", 10);
    vm.set_vm_isolates(&["isolates/1"]);
    vm.mock.reply(
        "_flutter.listViews",
        view_list(&["_flutterView/0x2", "_flutterView/0x1"], "isolates/1"),
    );
    vm.service.get_vm().await.unwrap();
    vm.service.refresh_views().await.unwrap();
}

#[tokio::test]
async fn list_views_populates_the_view_cache() {
    let vm = spawn_service().await;
    with_views(&vm).await;

    let views = vm.service.views();
    let ids: Vec<String> = views.iter().filter_map(|view| view.id()).collect();
    assert_eq!(ids, ["_flutterView/0x1", "_flutterView/0x2"]);

    let view = vm.service.vm().first_view().unwrap();
    assert!(view.has_isolate());
    assert_eq!(view.ui_isolate_id().as_deref(), Some("isolates/1"));
    let isolate = view.ui_isolate().unwrap();
    assert_eq!(isolate.id().as_deref(), Some("isolates/1"));
}

#[tokio::test]
async fn views_are_only_listed_on_flutter_engines() {
    let vm = spawn_service().await;
    vm.vm.lock()["_embedder"] = json!("Standalone");
    vm.service.get_vm().await.unwrap();

    vm.service.refresh_views().await.unwrap();
    assert!(vm.service.wait_for_views().await.unwrap().is_empty());
    assert_eq!(vm.mock.call_count("_flutter.listViews"), 0);
}

#[tokio::test]
async fn waiting_for_views_polls_until_one_appears() {
    let vm = spawn_service().await;
    vm.service.get_vm().await.unwrap();
    let polls = Arc::new(AtomicUsize::new(0));
    {
        let polls = polls.clone();
        vm.mock.handle("_flutter.listViews", move |_| {
            if polls.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(view_list(&[], "isolates/1"))
            } else {
                Ok(view_list(&["_flutterView/0x1"], "isolates/1"))
            }
        });
    }

    let views = within(vm.service.wait_for_views()).await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(polls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn waiting_for_views_gives_up_quietly() {
    let vm = spawn_service().await;
    vm.service.get_vm().await.unwrap();
    vm.mock
        .reply("_flutter.listViews", view_list(&[], "isolates/1"));

    let views = within(vm.service.wait_for_views()).await.unwrap();
    assert!(views.is_empty());
    let attempts = vm.service.config().view_wait_attempts as usize;
    assert_eq!(vm.mock.call_count("_flutter.listViews"), attempts + 1);
}

#[tokio::test]
async fn waiting_for_views_only_lists_views() {
    let vm = spawn_service().await;
    vm.service.get_vm().await.unwrap();
    vm.mock
        .reply("_flutter.listViews", view_list(&[], "isolates/1"));
    let vm_fetches = vm.mock.call_count("getVM");

    within(vm.service.wait_for_views()).await.unwrap();
    assert_eq!(vm.mock.call_count("getVM"), vm_fetches);
}

#[tokio::test]
async fn waiting_for_views_survives_failed_refreshes() {
    let vm = spawn_service_with(ConnectOptions {
        config: ServiceConfig {
            long_timeout_ms: 20,
            ..test_config()
        },
        reload_sources: None,
    })
    .await;
    vm.service.get_vm().await.unwrap();
    vm.mock.handle_with_delay(
        "_flutter.listViews",
        Duration::from_millis(500),
        |_| Ok(view_list(&["_flutterView/0x1"], "isolates/1")),
    );

    let views = within(vm.service.wait_for_views()).await.unwrap();
    assert!(views.is_empty());
    let attempts = vm.service.config().view_wait_attempts as usize;
    assert_eq!(vm.mock.call_count("_flutter.listViews"), attempts + 1);
}

#[tokio::test]
async fn run_from_source_waits_for_the_new_isolate() {
    let vm = spawn_service().await;
    with_views(&vm).await;
    vm.mock.reply("_flutter.runInView", json!({"type": "Success"}));
    let view = vm.service.vm().first_view().unwrap();

    let entry = Url::parse("file:///app/lib/main.dart").unwrap();
    let packages = Url::parse("file:///app/.packages").unwrap();
    let assets = Url::parse("file:///app/build/flutter_assets").unwrap();

    let drive = async {
        let mock = &vm.mock;
        wait_until("runInView", || mock.call_count("_flutter.runInView") == 1).await;
        vm.mock
            .send_event(
                streams::ISOLATE,
                json!({
                    "type": "Event",
                    "kind": "IsolateRunnable",
                    "isolate": {"type": "@Isolate", "id": "isolates/1", "name": "main"},
                    "timestamp": 1,
                }),
            )
            .await;
    };
    let (ran, ()) = within(async { tokio::join!(view.run_from_source(&entry, &packages, &assets), drive) }).await;
    ran.unwrap();

    let params = &vm.mock.calls("_flutter.runInView")[0];
    assert_eq!(params["viewId"], "_flutterView/0x1");
    assert_eq!(params["mainScript"], "/app/lib/main.dart");
    assert_eq!(params["packagesFile"], "/app/.packages");
    assert_eq!(params["assetDirectory"], "/app/build/flutter_assets");
    // Views are listed again once the isolate is up.
    assert_eq!(vm.mock.call_count("_flutter.listViews"), 2);
}

#[tokio::test]
async fn view_calls_name_the_view_and_isolate() {
    let vm = spawn_service().await;
    with_views(&vm).await;
    vm.mock.reply("_flutter.setAssetBundlePath", json!({"type": "Success"}));
    vm.mock.reply("_flutter.flushUIThreadTasks", json!({"type": "Success"}));
    let view = vm.service.vm().first_view().unwrap();

    let assets = Url::parse("file:///app/build/flutter_assets").unwrap();
    view.set_asset_directory(&assets).await.unwrap();
    view.flush_ui_thread_tasks().await.unwrap();

    let set = &vm.mock.calls("_flutter.setAssetBundlePath")[0];
    assert_eq!(set["viewId"], "_flutterView/0x1");
    assert_eq!(set["assetDirectory"], "/app/build/flutter_assets");
    let flush = &vm.mock.calls("_flutter.flushUIThreadTasks")[0];
    assert_eq!(flush["isolateId"], "isolates/1");
}

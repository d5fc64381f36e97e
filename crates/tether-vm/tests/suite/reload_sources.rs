use serde_json::{json, Value};
use tether_rpc::RpcErrorObject;
use tether_vm::{Isolate, RELOAD_BARRED};
use url::Url;

use crate::harness::{spawn_service, TestVm};

async fn main_isolate(vm: &TestVm) -> Isolate {
    vm.add_isolate("isolates/1", 10);
    vm.set_vm_isolates(&["isolates/1"]);
    vm.service.get_vm().await.unwrap();
    vm.service.vm().isolate("isolates/1").unwrap()
}

#[tokio::test]
async fn a_barred_reload_keeps_its_code() {
    let vm = spawn_service().await;
    vm.mock.handle("_reloadSources", |_| {
        Err(RpcErrorObject::new(RELOAD_BARRED, "isolate is not reloadable"))
    });
    let isolate = main_isolate(&vm).await;

    let err = isolate.reload_sources(false, None, None).await.unwrap_err();
    assert!(err.is_reload_barred(), "{err:?}");
    assert_eq!(err.code(), Some(RELOAD_BARRED));
}

#[tokio::test]
async fn reload_sources_sends_file_paths() {
    let vm = spawn_service().await;
    vm.mock
        .reply("_reloadSources", json!({"type": "ReloadReport", "success": true}));
    let isolate = main_isolate(&vm).await;

    let root = Url::parse("file:///app/lib/main.dart").unwrap();
    let packages = Url::parse("file:///app/.packages").unwrap();
    let report = isolate
        .reload_sources(true, Some(&root), Some(&packages))
        .await
        .unwrap();
    assert_eq!(report.get("success"), Some(&Value::Bool(true)));

    let params = &vm.mock.calls("_reloadSources")[0];
    assert_eq!(params["isolateId"], "isolates/1");
    assert_eq!(params["pause"], true);
    assert_eq!(params["rootLibUri"], "/app/lib/main.dart");
    assert_eq!(params["packagesUri"], "/app/.packages");
}

fn script_objects(vm: &TestVm) {
    vm.mock.handle("getObject", |params| match params["objectId"].as_str() {
        Some("functions/1") => Ok(json!({
            "type": "Function",
            "id": "functions/1",
            "name": "methodBar",
            "location": {
                "type": "SourceLocation",
                "tokenPos": 8,
                "script": {"type": "@Script", "id": "scripts/1"},
            },
        })),
        Some("functions/2") => Ok(json!({
            "type": "Function",
            "id": "functions/2",
            "name": "helper",
            "location": {
                "type": "SourceLocation",
                "tokenPos": 99,
                "script": {"type": "@Script", "id": "scripts/1"},
            },
        })),
        Some("scripts/1") => Ok(json!({
            "type": "Script",
            "id": "scripts/1",
            "uri": "file:///app/lib/main.dart",
            "tokenPosTable": [[10, 5, 3, 8, 7]],
        })),
        other => Err(RpcErrorObject::server_error(format!("unknown object {other:?}"))),
    });
}

#[tokio::test]
async fn unused_changes_are_mapped_to_source_lines() {
    let vm = spawn_service().await;
    vm.mock.reply(
        "_getUnusedChangesInLastReload",
        json!({
            "type": "UnusedChangesInLastReload",
            "unused": [
                {
                    "type": "@Function",
                    "id": "functions/1",
                    "name": "methodBar",
                    "_owner": {
                        "type": "@Class",
                        "id": "classes/1",
                        "name": "ClassFoo",
                        "_owner": {"type": "@Library", "id": "libraries/1", "name": "main"},
                    },
                },
                {
                    "type": "@Function",
                    "id": "functions/2",
                    "name": "helper",
                    "_owner": {"type": "@Library", "id": "libraries/1", "name": "main"},
                },
            ],
        }),
    );
    script_objects(&vm);
    let isolate = main_isolate(&vm).await;

    let unused = isolate.get_unused_changes_in_last_reload().await.unwrap();
    assert_eq!(unused.len(), 2);

    assert_eq!(unused[0].qualified_name, "ClassFoo.methodBar");
    assert_eq!(unused[0].uri.as_str(), "file:///app/lib/main.dart");
    assert_eq!((unused[0].line, unused[0].column), (Some(10), Some(7)));
    assert_eq!(
        unused[0].to_string(),
        "ClassFoo.methodBar (file:///app/lib/main.dart:10)"
    );

    // The token is not in the table, so the location stays unknown.
    assert_eq!(unused[1].qualified_name, "helper");
    assert_eq!((unused[1].line, unused[1].column), (None, None));
}

#[tokio::test]
async fn no_unused_changes_yield_an_empty_list() {
    let vm = spawn_service().await;
    vm.mock.reply(
        "_getUnusedChangesInLastReload",
        json!({"type": "UnusedChangesInLastReload", "unused": []}),
    );
    let isolate = main_isolate(&vm).await;

    assert!(isolate
        .get_unused_changes_in_last_reload()
        .await
        .unwrap()
        .is_empty());
    assert_eq!(vm.mock.call_count("getObject"), 0);
}

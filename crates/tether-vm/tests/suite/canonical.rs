use std::sync::Arc;

use serde_json::json;
use tether_vm::{Owner, ServiceObject, ServiceValue, VmServiceError};
use tokio::sync::Barrier;

use crate::harness::{map, spawn_service};

#[tokio::test]
async fn isolate_payloads_resolve_to_one_handle() {
    let vm = spawn_service().await;
    vm.add_isolate("isolates/1", 10);
    vm.set_vm_isolates(&["isolates/1"]);
    vm.service.get_vm().await.unwrap();

    let cached = vm.service.vm().isolate("isolates/1").unwrap();
    let resolved = vm
        .service
        .vm()
        .get_from_map(&map(json!({"type": "@Isolate", "id": "isolates/1"})))
        .unwrap();
    assert_eq!(resolved, ServiceObject::Isolate(cached.clone()));

    // An isolate-owned lookup for an isolate goes through the VM as well.
    let via_isolate = cached
        .get_from_map(&map(json!({"type": "@Isolate", "id": "isolates/1"})))
        .unwrap();
    assert_eq!(via_isolate, resolved);
}

#[tokio::test]
async fn only_fixed_ids_are_cached() {
    let vm = spawn_service().await;
    let owner = Owner::Vm(vm.service.vm().clone());

    let fixed = map(json!({"type": "@Instance", "id": "objects/1", "fixedId": true}));
    let first = owner.get_from_map(&fixed).unwrap();
    let second = owner.get_from_map(&fixed).unwrap();
    assert_eq!(first, second);
    assert!(first.can_cache());
    assert_eq!(vm.service.vm().cached_object("objects/1"), Some(first));

    let transient = map(json!({"type": "@Instance", "id": "objects/2"}));
    let first = owner.get_from_map(&transient).unwrap();
    let second = owner.get_from_map(&transient).unwrap();
    assert_ne!(first, second);
    assert!(vm.service.vm().cached_object("objects/2").is_none());
}

#[tokio::test]
async fn a_cached_object_keeps_its_type() {
    let vm = spawn_service().await;
    let owner = Owner::Vm(vm.service.vm().clone());
    owner
        .get_from_map(&map(json!({"type": "@Instance", "id": "objects/1", "fixedId": true})))
        .unwrap();

    let err = owner
        .get_from_map(&map(json!({"type": "@Library", "id": "objects/1", "fixedId": true})))
        .unwrap_err();
    assert!(matches!(err, VmServiceError::Load(_)), "{err:?}");

    let still = vm.service.vm().cached_object("objects/1").unwrap();
    assert_eq!(still.ty().as_deref(), Some("Instance"));
}

#[tokio::test]
async fn a_reference_does_not_unload_a_full_object() {
    let vm = spawn_service().await;
    let owner = Owner::Vm(vm.service.vm().clone());
    let library = owner
        .get_from_map(&map(json!({
            "type": "Library",
            "id": "libraries/1",
            "fixedId": true,
            "name": "main",
            "uri": "package:app/main.dart",
        })))
        .unwrap();
    assert!(library.loaded());

    owner
        .get_from_map(&map(json!({"type": "@Library", "id": "libraries/1", "name": "main"})))
        .unwrap();

    assert!(library.loaded());
    let entries = library.as_map().unwrap();
    assert_eq!(
        entries.get("uri").and_then(|uri| uri.as_str().map(str::to_owned)).as_deref(),
        Some("package:app/main.dart")
    );
}

#[tokio::test]
async fn upgrading_twice_changes_nothing() {
    let vm = spawn_service().await;
    let owner = Owner::Vm(vm.service.vm().clone());

    let mut value = ServiceValue::from_json(&json!({
        "count": 2,
        "items": [
            {"type": "@Instance", "id": "objects/1", "fixedId": true},
            {"plain": "map"},
        ],
    }));
    owner.upgrade(&mut value).unwrap();
    let once = value.clone();
    owner.upgrade(&mut value).unwrap();
    assert_eq!(value, once);

    let items = value.as_map().unwrap()["items"].as_list().unwrap();
    assert!(items[0].as_object().is_some());
    assert!(items[1].as_map().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_isolate_payloads_share_one_handle() {
    const CALLERS: usize = 8;
    let vm = spawn_service().await;
    let owner = vm.service.vm().clone();

    for round in 0..200 {
        let id = format!("isolates/{round}");
        let barrier = Arc::new(Barrier::new(CALLERS));
        let tasks: Vec<_> = (0..CALLERS)
            .map(|_| {
                let owner = owner.clone();
                let barrier = barrier.clone();
                let payload = map(json!({"type": "@Isolate", "id": id, "name": id}));
                tokio::spawn(async move {
                    barrier.wait().await;
                    owner.get_from_map(&payload).unwrap()
                })
            })
            .collect();

        let mut resolved = Vec::with_capacity(CALLERS);
        for task in tasks {
            resolved.push(task.await.unwrap());
        }
        let cached = ServiceObject::Isolate(owner.isolate(&id).unwrap());
        assert!(
            resolved.iter().all(|object| *object == cached),
            "round {round} produced more than one handle for {id}"
        );
    }
}

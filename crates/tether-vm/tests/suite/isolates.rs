use serde_json::json;
use tether_vm::{streams, EventKind, ServiceObject, Vm};

use crate::harness::{map, spawn_service, wait_until, within};

fn isolate_ids(vm: &Vm) -> Vec<String> {
    vm.isolates().iter().filter_map(|isolate| isolate.id()).collect()
}

#[tokio::test]
async fn isolates_are_ordered_by_start_time() {
    let vm = spawn_service().await;
    vm.add_isolate("isolates/a", 100);
    vm.add_isolate("isolates/b", 50);
    vm.set_vm_isolates(&["isolates/a", "isolates/b"]);
    vm.service.get_vm().await.unwrap();

    // Start times arrive with the eager `getIsolate` loads.
    let handle = vm.service.vm().clone();
    wait_until("isolates to load", || {
        handle.isolates().iter().all(|isolate| isolate.loaded())
    })
    .await;
    assert_eq!(isolate_ids(&handle), ["isolates/b", "isolates/a"]);
    assert_eq!(handle.first_isolate().and_then(|i| i.id()).as_deref(), Some("isolates/b"));
}

#[tokio::test]
async fn isolates_missing_from_get_vm_are_dropped() {
    let vm = spawn_service().await;
    vm.add_isolate("isolates/a", 100);
    vm.add_isolate("isolates/b", 50);
    vm.set_vm_isolates(&["isolates/a", "isolates/b"]);
    vm.service.get_vm().await.unwrap();
    let survivor = vm.service.vm().isolate("isolates/a").unwrap();

    vm.set_vm_isolates(&["isolates/a"]);
    vm.service.get_vm().await.unwrap();

    let handle = vm.service.vm();
    assert_eq!(isolate_ids(handle), ["isolates/a"]);
    assert!(handle.isolate("isolates/b").is_none());
    assert_eq!(
        ServiceObject::Isolate(handle.isolate("isolates/a").unwrap()),
        ServiceObject::Isolate(survivor)
    );
}

#[tokio::test]
async fn vm_stats_follow_get_vm() {
    let vm = spawn_service().await;
    vm.vm.lock()["_heapAllocatedMemoryUsage"] = 1024.into();
    vm.vm.lock()["_maxRSS"] = 4096.into();
    vm.service.get_vm().await.unwrap();

    let handle = vm.service.vm();
    assert!(handle.loaded());
    assert_eq!(handle.pid(), Some(4242));
    assert_eq!(handle.heap_allocated_memory_usage(), Some(1024));
    assert_eq!(handle.max_rss(), Some(4096));
    assert!(handle.is_flutter_engine());

    // A payload without the heap figure keeps the last known one.
    vm.vm
        .lock()
        .as_object_mut()
        .unwrap()
        .remove("_heapAllocatedMemoryUsage");
    vm.service.get_vm().await.unwrap();
    assert_eq!(handle.heap_allocated_memory_usage(), Some(1024));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exited_isolates_stay_out_of_the_list_under_concurrent_updates() {
    let vm = spawn_service().await;
    let owner = vm.service.vm().clone();
    let mut events = vm.service.on_isolate_event().await.unwrap();

    for round in 0..50 {
        let exiting = format!("isolates/x{round}");
        let updated = format!("isolates/y{round}");
        for id in [&exiting, &updated] {
            owner
                .get_from_map(&map(json!({"type": "@Isolate", "id": id, "name": id})))
                .unwrap();
        }

        let updates = {
            let owner = owner.clone();
            let updated = updated.clone();
            tokio::spawn(async move {
                for start_time in 0..20 {
                    owner
                        .get_from_map(&map(json!({
                            "type": "Isolate",
                            "id": updated,
                            "name": updated,
                            "startTime": start_time,
                        })))
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        vm.mock
            .send_event(
                streams::ISOLATE,
                json!({
                    "type": "Event",
                    "kind": "IsolateExit",
                    "isolate": {"type": "@Isolate", "id": exiting, "name": exiting},
                    "timestamp": round,
                }),
            )
            .await;
        let event = within(events.recv()).await.unwrap();
        assert_eq!(event.kind(), &EventKind::IsolateExit);
        updates.await.unwrap();

        assert!(owner.isolate(&exiting).is_none());
        let listed = isolate_ids(&owner);
        assert!(
            !listed.contains(&exiting),
            "round {round}: exited isolate still listed in {listed:?}"
        );
        assert!(listed.iter().all(|id| owner.isolate(id).is_some()));
    }
}

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tether_rpc::RpcErrorObject;

use crate::harness::spawn_service;

#[tokio::test]
async fn files_round_trip_through_the_dev_fs() {
    let vm = spawn_service().await;
    let files: Arc<Mutex<HashMap<String, Value>>> = Arc::default();
    {
        let files = files.clone();
        vm.mock.handle("_writeDevFSFile", move |params| {
            let path = params["path"].as_str().unwrap_or_default().to_owned();
            files.lock().insert(path, params["fileContents"].clone());
            Ok(json!({"type": "Success"}))
        });
    }
    {
        let files = files.clone();
        vm.mock.handle("_readDevFSFile", move |params| {
            let path = params["path"].as_str().unwrap_or_default();
            match files.lock().get(path) {
                Some(contents) => Ok(json!({"type": "FSFile", "fileContents": contents})),
                None => Err(RpcErrorObject::new(1002, "File not found")),
            }
        });
    }
    vm.mock.reply("_createDevFS", json!({"type": "FileSystem", "name": "app", "uri": "file:///tmp/app/"}));
    let handle = vm.service.vm();

    let created = handle.create_dev_fs("app").await.unwrap().unwrap();
    assert_eq!(created["uri"], "file:///tmp/app/");

    let contents = b"void main() {}\n\x00\xff";
    handle
        .write_dev_fs_file("app", "lib/main.dart", contents)
        .await
        .unwrap();
    let written = &vm.mock.calls("_writeDevFSFile")[0];
    assert_eq!(written["fsName"], "app");
    assert_eq!(written["fileContents"], "dm9pZCBtYWluKCkge30KAP8=");

    let read = handle.read_dev_fs_file("app", "lib/main.dart").await.unwrap();
    assert_eq!(read, contents);

    let missing = handle
        .read_dev_fs_file("app", "lib/other.dart")
        .await
        .unwrap_err();
    assert_eq!(missing.code(), Some(1002));
}

#[tokio::test]
async fn dev_fs_listing_and_deletion_name_the_file_system() {
    let vm = spawn_service().await;
    vm.mock.reply("_listDevFS", json!({"type": "FileSystemList", "fsNames": ["app"]}));
    vm.mock.reply("_listDevFSFiles", json!({"type": "FSFilesList", "files": [{"name": "/lib/main.dart"}]}));
    vm.mock.reply("_deleteDevFS", json!({"type": "Success"}));
    let handle = vm.service.vm();

    let listed = handle.list_dev_fs().await.unwrap().unwrap();
    assert_eq!(listed["fsNames"], json!(["app"]));
    let files = handle.list_dev_fs_files("app").await.unwrap().unwrap();
    assert_eq!(files["files"][0]["name"], "/lib/main.dart");
    handle.delete_dev_fs("app").await.unwrap();

    assert_eq!(vm.mock.calls("_listDevFSFiles")[0]["fsName"], "app");
    assert_eq!(vm.mock.calls("_deleteDevFS")[0]["fsName"], "app");
}

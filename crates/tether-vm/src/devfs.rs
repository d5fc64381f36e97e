//! Dev file system calls. File contents travel base64-encoded.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};

use crate::error::{Result, VmServiceError};
use crate::invoke::CallOptions;
use crate::vm::Vm;
use crate::JsonMap;

fn fs_params(fs_name: &str) -> JsonMap {
    let mut params = JsonMap::new();
    params.insert("fsName".to_owned(), json!(fs_name));
    params
}

impl Vm {
    pub async fn create_dev_fs(&self, fs_name: &str) -> Result<Option<JsonMap>> {
        self.invoke_rpc_raw("_createDevFS", fs_params(fs_name), CallOptions::default())
            .await
    }

    pub async fn list_dev_fs(&self) -> Result<Option<JsonMap>> {
        self.invoke_rpc_raw("_listDevFS", JsonMap::new(), CallOptions::default())
            .await
    }

    pub async fn write_dev_fs_file(
        &self,
        fs_name: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<Option<JsonMap>> {
        let mut params = fs_params(fs_name);
        params.insert("path".to_owned(), json!(path));
        params.insert("fileContents".to_owned(), json!(BASE64.encode(contents)));
        self.invoke_rpc_raw("_writeDevFSFile", params, CallOptions::default())
            .await
    }

    pub async fn read_dev_fs_file(&self, fs_name: &str, path: &str) -> Result<Vec<u8>> {
        let mut params = fs_params(fs_name);
        params.insert("path".to_owned(), json!(path));
        let response = self
            .invoke_rpc_raw("_readDevFSFile", params, CallOptions::default().strict())
            .await?
            .unwrap_or_default();
        let encoded = response
            .get("fileContents")
            .and_then(Value::as_str)
            .ok_or_else(|| VmServiceError::load(format!("no contents returned for `{path}`")))?;
        BASE64
            .decode(encoded)
            .map_err(|err| VmServiceError::load(format!("contents of `{path}` are not base64: {err}")))
    }

    pub async fn list_dev_fs_files(&self, fs_name: &str) -> Result<Option<JsonMap>> {
        self.invoke_rpc_raw("_listDevFSFiles", fs_params(fs_name), CallOptions::default())
            .await
    }

    pub async fn delete_dev_fs(&self, fs_name: &str) -> Result<Option<JsonMap>> {
        self.invoke_rpc_raw("_deleteDevFS", fs_params(fs_name), CallOptions::default())
            .await
    }
}

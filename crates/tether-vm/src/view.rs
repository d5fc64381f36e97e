use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use url::Url;

use crate::error::{Result, VmServiceError};
use crate::event::{streams, EventKind};
use crate::invoke::CallOptions;
use crate::isolate::Isolate;
use crate::object::{ObjectHeader, Payload, ReloadSlot, ServiceObject};
use crate::vm::{Vm, VmState};
use crate::{file_path_param, JsonMap};

#[derive(Debug)]
pub(crate) struct ViewState {
    vm: Weak<VmState>,
    header: Mutex<ObjectHeader>,
    ui_isolate_id: Mutex<Option<String>>,
    reload: ReloadSlot,
}

/// A renderable surface. The isolate driving it is referenced by id only.
#[derive(Debug, Clone)]
pub struct FlutterView {
    inner: Arc<ViewState>,
}

impl FlutterView {
    pub(crate) fn new(vm: Weak<VmState>) -> Self {
        Self {
            inner: Arc::new(ViewState {
                vm,
                header: Mutex::new(ObjectHeader::default()),
                ui_isolate_id: Mutex::new(None),
                reload: ReloadSlot::default(),
            }),
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn header(&self) -> ObjectHeader {
        self.inner.header.lock().clone()
    }

    pub(crate) fn reload_slot(&self) -> &ReloadSlot {
        &self.inner.reload
    }

    pub fn vm(&self) -> Result<Vm> {
        Vm::from_weak(&self.inner.vm)
    }

    pub fn id(&self) -> Option<String> {
        self.inner.header.lock().id.clone()
    }

    pub fn ui_isolate_id(&self) -> Option<String> {
        self.inner.ui_isolate_id.lock().clone()
    }

    pub fn has_isolate(&self) -> bool {
        self.inner.ui_isolate_id.lock().is_some()
    }

    /// The isolate driving this view, looked up in the VM.
    pub fn ui_isolate(&self) -> Option<Isolate> {
        let id = self.ui_isolate_id()?;
        self.vm().ok()?.isolate(&id)
    }

    pub(crate) fn apply(&self, payload: &Payload<'_>) -> Result<()> {
        self.inner.header.lock().apply(payload)?;

        let isolate_id = match payload.map.get("isolate") {
            Some(Value::Object(isolate)) => self.vm()?.get_from_map(isolate)?.id(),
            Some(_) => None,
            None if payload.is_ref => return Ok(()),
            None => None,
        };
        *self.inner.ui_isolate_id.lock() = isolate_id;
        Ok(())
    }

    fn view_id(&self) -> Result<String> {
        self.id()
            .ok_or_else(|| VmServiceError::load("view has no id"))
    }

    pub async fn set_asset_directory(&self, asset_directory: &Url) -> Result<()> {
        let mut params = JsonMap::new();
        params.insert("viewId".to_owned(), json!(self.view_id()?));
        params.insert(
            "assetDirectory".to_owned(),
            json!(file_path_param(asset_directory)),
        );
        self.vm()?
            .invoke_rpc("_flutter.setAssetBundlePath", params, CallOptions::default())
            .await?;
        Ok(())
    }

    /// Waits for the UI thread to drain its task queue.
    pub async fn flush_ui_thread_tasks(&self) -> Result<()> {
        let Some(isolate_id) = self.ui_isolate_id() else {
            tracing::debug!(target: "tether.vm", view = ?self.id(), "view has no UI isolate; nothing to flush");
            return Ok(());
        };
        let mut params = JsonMap::new();
        params.insert("isolateId".to_owned(), json!(isolate_id));
        self.vm()?
            .invoke_rpc_raw("_flutter.flushUIThreadTasks", params, CallOptions::default())
            .await?;
        Ok(())
    }

    /// Restarts the view from the given sources and waits until the new
    /// isolate is runnable, then refreshes the VM's views.
    pub async fn run_from_source(
        &self,
        entry: &Url,
        packages: &Url,
        asset_directory: &Url,
    ) -> Result<()> {
        let vm = self.vm()?;
        let view_id = self.view_id()?;
        // Subscribe before launching so the runnable event cannot be missed.
        let mut events = vm.on_event(streams::ISOLATE).await?;
        let closed = vm.rpc().peer().shutdown_token();

        vm.run_in_view(&view_id, entry, packages, asset_directory)
            .await?;

        loop {
            let event = tokio::select! {
                _ = closed.cancelled() => {
                    return Err(VmServiceError::Transport {
                        method: "_flutter.runInView".to_owned(),
                        source: tether_rpc::RpcTransportError::ConnectionClosed,
                    });
                }
                event = events.recv() => event,
            };
            match event {
                Ok(event) if *event.kind() == EventKind::IsolateRunnable => {
                    tracing::debug!(target: "tether.vm", isolate = ?event.isolate_id(), "isolate is runnable");
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(target: "tether.vm", skipped, "isolate stream lagged");
                }
                Err(RecvError::Closed) => return Err(VmServiceError::Detached),
            }
        }

        vm.refresh_views().await
    }

    pub async fn reload(&self) -> Result<ServiceObject> {
        ServiceObject::View(self.clone()).reload().await
    }
}

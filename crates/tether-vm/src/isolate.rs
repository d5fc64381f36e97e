use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use url::Url;

use crate::error::{Result, VmServiceError};
use crate::event::ServiceEvent;
use crate::heap::HeapSpace;
use crate::invoke::CallOptions;
use crate::object::{
    ObjectHeader, ObjectKind, Owner, Payload, ReloadSlot, ServiceObject,
};
use crate::value::{upgrade_entries, ServiceValue};
use crate::vm::{Vm, VmState};
use crate::{file_path_param, JsonMap};

#[derive(Debug, Default)]
struct IsolateData {
    start_time: Option<i64>,
    pause_event: Option<ServiceEvent>,
    root_lib: Option<ServiceObject>,
    extension_rpcs: Vec<String>,
    new_space: Option<HeapSpace>,
    old_space: Option<HeapSpace>,
    entries: BTreeMap<String, ServiceValue>,
}

#[derive(Debug)]
pub(crate) struct IsolateState {
    vm: Weak<VmState>,
    header: Mutex<ObjectHeader>,
    data: Mutex<IsolateData>,
    cache: Mutex<HashMap<String, ServiceObject>>,
    reload: ReloadSlot,
}

/// An isolate: one independently scheduled execution context in the VM.
///
/// Owned by the [`Vm`]; canonicalizes the objects that live in its heap.
#[derive(Debug, Clone)]
pub struct Isolate {
    inner: Arc<IsolateState>,
}

impl Isolate {
    pub(crate) fn new(vm: Weak<VmState>) -> Self {
        Self {
            inner: Arc::new(IsolateState {
                vm,
                header: Mutex::new(ObjectHeader::default()),
                data: Mutex::new(IsolateData::default()),
                cache: Mutex::new(HashMap::new()),
                reload: ReloadSlot::default(),
            }),
        }
    }

    pub(crate) fn from_weak(weak: &Weak<IsolateState>) -> Result<Self> {
        weak.upgrade()
            .map(|inner| Self { inner })
            .ok_or(VmServiceError::Detached)
    }

    pub(crate) fn downgrade(&self) -> Weak<IsolateState> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn vm_weak(&self) -> Weak<VmState> {
        self.inner.vm.clone()
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

    pub fn name(&self) -> Option<String> {
        self.inner.header.lock().name.clone()
    }

    pub fn loaded(&self) -> bool {
        self.inner.header.lock().loaded
    }

    /// Milliseconds since the epoch at which the isolate started.
    pub fn start_time(&self) -> Option<i64> {
        self.inner.data.lock().start_time
    }

    /// The most recent pause or resume event.
    pub fn pause_event(&self) -> Option<ServiceEvent> {
        self.inner.data.lock().pause_event.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.pause_event()
            .is_some_and(|event| event.is_pause_event())
    }

    pub fn root_lib(&self) -> Option<ServiceObject> {
        self.inner.data.lock().root_lib.clone()
    }

    /// Service extensions the isolate has registered.
    pub fn extension_rpcs(&self) -> Vec<String> {
        self.inner.data.lock().extension_rpcs.clone()
    }

    pub fn new_space(&self) -> Option<HeapSpace> {
        self.inner.data.lock().new_space
    }

    pub fn old_space(&self) -> Option<HeapSpace> {
        self.inner.data.lock().old_space
    }

    /// An upgraded entry of the last full payload.
    pub fn get(&self, key: &str) -> Option<ServiceValue> {
        self.inner.data.lock().entries.get(key).cloned()
    }

    pub fn cached_object(&self, id: &str) -> Option<ServiceObject> {
        self.inner.cache.lock().get(id).cloned()
    }

    pub(crate) fn set_pause_event(&self, event: ServiceEvent) {
        self.inner.data.lock().pause_event = Some(event);
    }

    pub(crate) fn add_extension_rpc(&self, name: &str) {
        let mut data = self.inner.data.lock();
        if !data.extension_rpcs.iter().any(|known| known == name) {
            data.extension_rpcs.push(name.to_owned());
        }
    }

    pub(crate) fn apply(&self, payload: &Payload<'_>) -> Result<()> {
        self.inner.header.lock().apply(payload)?;
        if payload.is_ref {
            return Ok(());
        }

        let owner = Owner::Isolate(self.clone());
        let entries = upgrade_entries(&owner, payload.map, &["_heaps"])?;

        let pause_event = entries
            .get("pauseEvent")
            .and_then(ServiceValue::as_object)
            .and_then(ServiceObject::as_event)
            .cloned();
        let root_lib = entries
            .get("rootLib")
            .and_then(ServiceValue::as_object)
            .cloned();
        let extension_rpcs = payload
            .map
            .get("extensionRPCs")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let heaps = payload.map.get("_heaps").and_then(Value::as_object);
        let space = |name: &str| {
            heaps
                .and_then(|heaps| heaps.get(name))
                .and_then(Value::as_object)
                .map(HeapSpace::from_map)
        };
        let start_time = payload.map.get("startTime").and_then(Value::as_i64);

        let start_time_changed = {
            let mut data = self.inner.data.lock();
            let changed = data.start_time != start_time;
            data.start_time = start_time;
            data.pause_event = pause_event;
            data.root_lib = root_lib;
            data.extension_rpcs = extension_rpcs;
            data.new_space = space("new");
            data.old_space = space("old");
            data.entries = entries;
            changed
        };

        if start_time_changed {
            if let Ok(vm) = self.vm() {
                vm.rebuild_isolate_list();
            }
        }
        Ok(())
    }

    /// Returns the canonical instance for `map`. Isolates and the VM are
    /// canonicalized by the VM.
    pub fn get_from_map(&self, map: &JsonMap) -> Result<ServiceObject> {
        let payload = Payload::classify(map)?;
        if matches!(ObjectKind::of(payload.ty), ObjectKind::Isolate | ObjectKind::Vm) {
            return self.vm()?.get_from_map(map);
        }

        let existing = payload
            .id()
            .and_then(|id| self.inner.cache.lock().get(id).cloned());
        if let Some(object) = existing {
            object.apply(&payload)?;
            return Ok(object);
        }

        let object = ServiceObject::build(&Owner::Isolate(self.clone()), &payload)?;
        if object.can_cache() {
            if let Some(id) = object.id() {
                return Ok(self
                    .inner
                    .cache
                    .lock()
                    .entry(id)
                    .or_insert(object)
                    .clone());
            }
        }
        Ok(object)
    }

    /// Fetches the isolate's full state. See [`ServiceObject::reload`].
    pub async fn reload(&self) -> Result<ServiceObject> {
        ServiceObject::Isolate(self.clone()).reload().await
    }

    /// Calls `method` scoped to this isolate. `isolateId` is always set to this
    /// isolate's id, replacing any caller-supplied value.
    pub async fn invoke_rpc_raw(
        &self,
        method: &str,
        mut params: JsonMap,
        options: CallOptions,
    ) -> Result<Option<JsonMap>> {
        params.insert("isolateId".to_owned(), json!(self.id()));
        self.vm()?.invoke_rpc_raw(method, params, options).await
    }

    /// Like [`Isolate::invoke_rpc_raw`], canonicalizing the result.
    pub async fn invoke_rpc(
        &self,
        method: &str,
        params: JsonMap,
        options: CallOptions,
    ) -> Result<Option<ServiceObject>> {
        self.invoke_rpc_raw(method, params, options)
            .await?
            .map(|response| self.get_from_map(&response))
            .transpose()
    }

    pub async fn get_object(&self, object_id: &str) -> Result<Option<ServiceObject>> {
        let mut params = JsonMap::new();
        params.insert("objectId".to_owned(), json!(object_id));
        self.invoke_rpc("getObject", params, CallOptions::default())
            .await
    }

    pub async fn resume(&self) -> Result<Option<JsonMap>> {
        self.invoke_rpc_raw("resume", JsonMap::new(), CallOptions::default())
            .await
    }

    /// Asks the VM to reload the isolate's sources.
    ///
    /// Application errors are returned as-is so callers can recognise a
    /// refused reload with [`VmServiceError::is_reload_barred`].
    pub async fn reload_sources(
        &self,
        pause: bool,
        root_lib: Option<&Url>,
        packages: Option<&Url>,
    ) -> Result<JsonMap> {
        let mut params = JsonMap::new();
        params.insert("pause".to_owned(), json!(pause));
        if let Some(root_lib) = root_lib {
            params.insert("rootLibUri".to_owned(), json!(file_path_param(root_lib)));
        }
        if let Some(packages) = packages {
            params.insert("packagesUri".to_owned(), json!(file_path_param(packages)));
        }
        let response = self
            .invoke_rpc_raw("_reloadSources", params, CallOptions::default().strict())
            .await?;
        Ok(response.unwrap_or_default())
    }
}

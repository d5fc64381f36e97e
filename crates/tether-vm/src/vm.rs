use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use url::Url;

use crate::error::{Result, VmServiceError};
use crate::event::{EventHub, EventKind, ServiceEvent};
use crate::invoke::{CallOptions, Rpc};
use crate::isolate::Isolate;
use crate::object::{ObjectHeader, ObjectKind, Owner, Payload, ReloadSlot, ServiceObject};
use crate::view::FlutterView;
use crate::{file_path_param, JsonMap};

/// Process-level statistics reported with the VM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmStats {
    pub pid: Option<i64>,
    pub heap_allocated_memory_usage: Option<i64>,
    pub max_rss: Option<i64>,
    pub embedder: Option<String>,
    pub version: Option<String>,
}

pub(crate) struct VmState {
    rpc: Rpc,
    header: Mutex<ObjectHeader>,
    stats: Mutex<VmStats>,
    cache: Mutex<HashMap<String, ServiceObject>>,
    isolate_cache: Mutex<HashMap<String, Isolate>>,
    isolates: Mutex<Vec<Isolate>>,
    views: Mutex<HashMap<String, FlutterView>>,
    reload: ReloadSlot,
    events: EventHub,
}

impl std::fmt::Debug for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmState")
            .field("header", &*self.header.lock())
            .field("stats", &*self.stats.lock())
            .field("isolates", &self.isolate_cache.lock().len())
            .field("views", &self.views.lock().len())
            .finish_non_exhaustive()
    }
}

/// The root of the object graph.
///
/// Owns the isolate and view caches; there is one per connection.
#[derive(Debug, Clone)]
pub struct Vm {
    inner: Arc<VmState>,
}

/// Isolates with a start time come first, oldest first.
fn compare_start_times(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl Vm {
    pub(crate) fn new(rpc: Rpc, event_capacity: usize) -> Self {
        Self {
            inner: Arc::new(VmState {
                rpc,
                header: Mutex::new(ObjectHeader::default()),
                stats: Mutex::new(VmStats::default()),
                cache: Mutex::new(HashMap::new()),
                isolate_cache: Mutex::new(HashMap::new()),
                isolates: Mutex::new(Vec::new()),
                views: Mutex::new(HashMap::new()),
                reload: ReloadSlot::default(),
                events: EventHub::new(event_capacity),
            }),
        }
    }

    pub(crate) fn from_weak(weak: &Weak<VmState>) -> Result<Self> {
        weak.upgrade()
            .map(|inner| Self { inner })
            .ok_or(VmServiceError::Detached)
    }

    pub(crate) fn downgrade(&self) -> Weak<VmState> {
        Arc::downgrade(&self.inner)
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

    pub(crate) fn rpc(&self) -> &Rpc {
        &self.inner.rpc
    }

    pub fn name(&self) -> Option<String> {
        self.inner.header.lock().name.clone()
    }

    pub fn loaded(&self) -> bool {
        self.inner.header.lock().loaded
    }

    pub fn stats(&self) -> VmStats {
        self.inner.stats.lock().clone()
    }

    pub fn pid(&self) -> Option<i64> {
        self.inner.stats.lock().pid
    }

    pub fn heap_allocated_memory_usage(&self) -> Option<i64> {
        self.inner.stats.lock().heap_allocated_memory_usage
    }

    pub fn max_rss(&self) -> Option<i64> {
        self.inner.stats.lock().max_rss
    }

    pub fn embedder(&self) -> Option<String> {
        self.inner.stats.lock().embedder.clone()
    }

    pub fn version(&self) -> Option<String> {
        self.inner.stats.lock().version.clone()
    }

    pub fn is_flutter_engine(&self) -> bool {
        self.inner.stats.lock().embedder.as_deref() == Some("Flutter")
    }

    /// Live isolates ordered by start time; isolates without one come last.
    pub fn isolates(&self) -> Vec<Isolate> {
        self.inner.isolates.lock().clone()
    }

    pub fn first_isolate(&self) -> Option<Isolate> {
        self.inner.isolates.lock().first().cloned()
    }

    pub fn isolate(&self, id: &str) -> Option<Isolate> {
        self.inner.isolate_cache.lock().get(id).cloned()
    }

    /// Known views, ordered by id.
    pub fn views(&self) -> Vec<FlutterView> {
        let mut views: Vec<(String, FlutterView)> = self
            .inner
            .views
            .lock()
            .iter()
            .map(|(id, view)| (id.clone(), view.clone()))
            .collect();
        views.sort_by(|a, b| a.0.cmp(&b.0));
        views.into_iter().map(|(_, view)| view).collect()
    }

    pub fn first_view(&self) -> Option<FlutterView> {
        self.views().into_iter().next()
    }

    pub fn view(&self, id: &str) -> Option<FlutterView> {
        self.inner.views.lock().get(id).cloned()
    }

    pub fn cached_object(&self, id: &str) -> Option<ServiceObject> {
        self.inner.cache.lock().get(id).cloned()
    }

    /// Returns the canonical instance for `map`.
    ///
    /// A `VM` payload updates this VM. Isolates and views always live in
    /// their own caches; other objects are cached only when their id is
    /// fixed.
    pub fn get_from_map(&self, map: &JsonMap) -> Result<ServiceObject> {
        let payload = Payload::classify(map)?;
        match ObjectKind::of(payload.ty) {
            ObjectKind::Vm => {
                self.apply(&payload)?;
                Ok(ServiceObject::Vm(self.clone()))
            }
            ObjectKind::Isolate => self.canonical_isolate(&payload).map(ServiceObject::Isolate),
            ObjectKind::View => self.canonical_view(&payload).map(ServiceObject::View),
            ObjectKind::Event | ObjectKind::Map => self.canonical_object(&payload),
        }
    }

    fn canonical_isolate(&self, payload: &Payload<'_>) -> Result<Isolate> {
        let id = payload
            .id()
            .ok_or_else(|| VmServiceError::load("isolate payload has no id"))?;

        // Resolve or insert under one lock so concurrent callers share an instance.
        // The entry exists before `apply` so a payload mentioning the isolate
        // itself resolves to it.
        let (isolate, created) = match self.inner.isolate_cache.lock().entry(id.to_owned()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => (entry.insert(Isolate::new(self.downgrade())).clone(), true),
        };
        if let Err(err) = isolate.apply(payload) {
            if created {
                let mut cache = self.inner.isolate_cache.lock();
                if cache.get(id).is_some_and(|cached| cached.ptr_eq(&isolate)) {
                    cache.remove(id);
                }
            }
            return Err(err);
        }
        if created {
            self.rebuild_isolate_list();
            spawn_eager_load(&isolate);
        }
        Ok(isolate)
    }

    fn canonical_view(&self, payload: &Payload<'_>) -> Result<FlutterView> {
        let id = payload
            .id()
            .ok_or_else(|| VmServiceError::load("view payload has no id"))?;

        let existing = self.inner.views.lock().get(id).cloned();
        if let Some(view) = existing {
            view.apply(payload)?;
            return Ok(view);
        }

        let view = FlutterView::new(self.downgrade());
        view.apply(payload)?;
        Ok(self
            .inner
            .views
            .lock()
            .entry(id.to_owned())
            .or_insert(view)
            .clone())
    }

    fn canonical_object(&self, payload: &Payload<'_>) -> Result<ServiceObject> {
        let existing = payload
            .id()
            .and_then(|id| self.inner.cache.lock().get(id).cloned());
        if let Some(object) = existing {
            object.apply(payload)?;
            return Ok(object);
        }

        let object = ServiceObject::build(&Owner::Vm(self.clone()), payload)?;
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

    pub(crate) fn apply(&self, payload: &Payload<'_>) -> Result<()> {
        self.inner.header.lock().apply(payload)?;
        if payload.is_ref {
            return Ok(());
        }

        // Canonicalizing the isolate list creates entries for new isolates.
        let live = match payload.map.get("isolates") {
            Some(Value::Array(isolates)) => {
                let mut live = HashSet::new();
                for isolate in isolates {
                    let Value::Object(isolate) = isolate else {
                        return Err(VmServiceError::load(format!(
                            "VM isolate entry is not an object: {isolate}"
                        )));
                    };
                    if let Some(id) = self.get_from_map(isolate)?.id() {
                        live.insert(id);
                    }
                }
                Some(live)
            }
            Some(other) => {
                return Err(VmServiceError::load(format!(
                    "VM `isolates` is not a list: {other}"
                )))
            }
            None => None,
        };

        {
            let map = payload.map;
            let int = |key: &str| map.get(key).and_then(Value::as_i64);
            let mut stats = self.inner.stats.lock();
            stats.pid = int("pid");
            if let Some(usage) = int("_heapAllocatedMemoryUsage") {
                stats.heap_allocated_memory_usage = Some(usage);
            }
            stats.max_rss = int("_maxRSS");
            stats.embedder = payload.str("_embedder").map(str::to_owned);
            stats.version = payload.str("version").map(str::to_owned);
        }

        if let Some(live) = live {
            self.remove_dead_isolates(&live);
        }
        Ok(())
    }

    fn remove_dead_isolates(&self, live: &HashSet<String>) {
        let mut cache = self.inner.isolate_cache.lock();
        cache.retain(|id, _| {
            let keep = live.contains(id);
            if !keep {
                tracing::debug!(target: "tether.vm", isolate = %id, "dropping dead isolate");
            }
            keep
        });
        self.store_isolate_list(&cache);
    }

    pub(crate) fn remove_isolate(&self, id: &str) {
        let mut cache = self.inner.isolate_cache.lock();
        cache.remove(id);
        self.store_isolate_list(&cache);
    }

    pub(crate) fn rebuild_isolate_list(&self) {
        let cache = self.inner.isolate_cache.lock();
        self.store_isolate_list(&cache);
    }

    /// Must be called with the isolate cache locked, so that the list never
    /// lags behind a removal.
    fn store_isolate_list(&self, cache: &HashMap<String, Isolate>) {
        let mut isolates: Vec<(&String, &Isolate)> = cache.iter().collect();
        isolates.sort_by(|a, b| a.0.cmp(b.0));
        let mut isolates: Vec<Isolate> =
            isolates.into_iter().map(|(_, isolate)| isolate.clone()).collect();
        // Stable, so isolates without a start time keep their id order.
        isolates.sort_by(|a, b| compare_start_times(a.start_time(), b.start_time()));
        *self.inner.isolates.lock() = isolates;
    }

    /// Fetches the VM's full state with `getVM`.
    pub async fn reload(&self) -> Result<Vm> {
        match ServiceObject::Vm(self.clone()).reload().await? {
            ServiceObject::Vm(vm) => Ok(vm),
            other => Err(VmServiceError::load(format!(
                "getVM produced a `{}`",
                other.ty().unwrap_or_default()
            ))),
        }
    }

    pub async fn invoke_rpc_raw(
        &self,
        method: &str,
        params: JsonMap,
        options: CallOptions,
    ) -> Result<Option<JsonMap>> {
        self.inner.rpc.call(method, params, options).await
    }

    /// Like [`Vm::invoke_rpc_raw`], canonicalizing the result.
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

    /// Subscribes to a stream. The first subscription to a stream also asks
    /// the VM to start sending it; concurrent first subscribers wait for that
    /// request instead of sending their own.
    pub async fn on_event(&self, stream_id: &str) -> Result<broadcast::Receiver<ServiceEvent>> {
        let receiver = self.inner.events.subscribe(stream_id);
        self.inner
            .events
            .listen_state(stream_id)
            .get_or_try_init(|| async {
                let mut params = JsonMap::new();
                params.insert("streamId".to_owned(), json!(stream_id));
                self.invoke_rpc_raw("streamListen", params, CallOptions::default())
                    .await
                    .map(drop)
            })
            .await?;
        Ok(receiver)
    }

    /// Applies a `streamNotify` event to the object graph and publishes it.
    pub(crate) fn handle_event(&self, stream_id: &str, data: &JsonMap) -> Result<ServiceEvent> {
        let isolate = match data.get("isolate") {
            Some(Value::Object(isolate)) => match self.get_from_map(isolate)? {
                ServiceObject::Isolate(isolate) => Some(isolate),
                other => {
                    return Err(VmServiceError::load(format!(
                        "event isolate is a `{}`",
                        other.ty().unwrap_or_default()
                    )))
                }
            },
            _ => None,
        };

        let event = match &isolate {
            Some(isolate) => ServiceEvent::from_map(&Owner::Isolate(isolate.clone()), data)?,
            None => ServiceEvent::from_map(&Owner::Vm(self.clone()), data)?,
        };
        tracing::trace!(target: "tether.vm", stream = stream_id, kind = %event.kind(), isolate = ?event.isolate_id(), "event");

        if let Some(isolate) = &isolate {
            match event.kind() {
                EventKind::IsolateExit => {
                    if let Some(id) = isolate.id() {
                        self.remove_isolate(&id);
                    }
                }
                EventKind::IsolateRunnable => {
                    // The root library only becomes available once the isolate is runnable.
                    spawn_eager_load(isolate);
                }
                EventKind::ServiceExtensionAdded => {
                    if let Some(name) = event.extension_rpc() {
                        isolate.add_extension_rpc(name);
                    }
                }
                kind if kind.is_pause_event() || *kind == EventKind::Resume => {
                    isolate.set_pause_event(event.clone());
                }
                _ => {}
            }
        }

        self.inner.events.publish(stream_id, event.clone());
        Ok(event)
    }

    /// Rebuilds the view cache from `_flutter.listViews`.
    pub async fn refresh_views(&self) -> Result<()> {
        if !self.is_flutter_engine() {
            return Ok(());
        }
        self.inner.views.lock().clear();
        self.invoke_rpc("_flutter.listViews", JsonMap::new(), CallOptions::long())
            .await?;
        Ok(())
    }

    pub async fn run_in_view(
        &self,
        view_id: &str,
        main: &Url,
        packages: &Url,
        asset_directory: &Url,
    ) -> Result<Option<ServiceObject>> {
        let mut params = JsonMap::new();
        params.insert("viewId".to_owned(), json!(view_id));
        params.insert("mainScript".to_owned(), json!(file_path_param(main)));
        params.insert("packagesFile".to_owned(), json!(file_path_param(packages)));
        params.insert(
            "assetDirectory".to_owned(),
            json!(file_path_param(asset_directory)),
        );
        self.invoke_rpc("_flutter.runInView", params, CallOptions::default())
            .await
    }

    pub async fn clear_vm_timeline(&self) -> Result<Option<JsonMap>> {
        self.invoke_rpc_raw("_clearVMTimeline", JsonMap::new(), CallOptions::default())
            .await
    }

    pub async fn set_vm_timeline_flags(
        &self,
        recorded_streams: &[&str],
    ) -> Result<Option<JsonMap>> {
        let mut params = JsonMap::new();
        params.insert("recordedStreams".to_owned(), json!(recorded_streams));
        self.invoke_rpc_raw("_setVMTimelineFlags", params, CallOptions::default())
            .await
    }

    pub async fn get_vm_timeline(&self) -> Result<Option<JsonMap>> {
        self.invoke_rpc_raw("_getVMTimeline", JsonMap::new(), CallOptions::long())
            .await
    }
}

/// Loads an isolate in the background. Failures are only logged.
fn spawn_eager_load(isolate: &Isolate) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let isolate = isolate.clone();
    runtime.spawn(async move {
        if let Err(err) = isolate.reload().await {
            tracing::debug!(
                target: "tether.vm",
                isolate = ?isolate.id(),
                error = %err,
                "eager isolate load failed"
            );
        }
    });
}

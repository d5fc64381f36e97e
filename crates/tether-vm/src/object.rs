//! Identity, canonicalization and reload for every wire-described object.

use std::sync::Weak;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::error::{Result, VmServiceError};
use crate::event::ServiceEvent;
use crate::invoke::CallOptions;
use crate::isolate::{Isolate, IsolateState};
use crate::map::ServiceMap;
use crate::value::{upgrade, ServiceValue};
use crate::view::FlutterView;
use crate::vm::{Vm, VmState};
use crate::JsonMap;

/// Type tag of payloads that stand in for a collected or expired object.
pub const SENTINEL_TYPE: &str = "Sentinel";

/// Splits a leading `@` reference marker off a type tag.
pub(crate) fn strip_ref(raw: &str) -> (&str, bool) {
    match raw.strip_prefix('@') {
        Some(ty) => (ty, true),
        None => (raw, false),
    }
}

/// A wire payload with its type tag resolved once.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Payload<'a> {
    pub map: &'a JsonMap,
    pub ty: &'a str,
    pub is_ref: bool,
}

impl<'a> Payload<'a> {
    pub fn classify(map: &'a JsonMap) -> Result<Self> {
        let raw = match map.get("type") {
            Some(Value::String(raw)) => raw.as_str(),
            Some(other) => {
                return Err(VmServiceError::load(format!(
                    "type tag is not a string: {other}"
                )))
            }
            None => {
                return Err(VmServiceError::load(format!(
                    "payload has no type tag: {}",
                    Value::Object(map.clone())
                )))
            }
        };
        let (ty, is_ref) = strip_ref(raw);
        if ty.is_empty() {
            return Err(VmServiceError::load("payload has an empty type tag"));
        }
        Ok(Self { map, ty, is_ref })
    }

    pub fn id(&self) -> Option<&'a str> {
        self.str("id")
    }

    pub fn str(&self, key: &str) -> Option<&'a str> {
        self.map.get(key).and_then(Value::as_str)
    }
}

/// Identity fields shared by every service object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ObjectHeader {
    pub id: Option<String>,
    pub ty: Option<String>,
    pub vm_type: Option<String>,
    pub can_cache: bool,
    pub loaded: bool,
    pub name: Option<String>,
    pub vm_name: Option<String>,
}

impl ObjectHeader {
    /// Validates and copies the identity fields of `payload`.
    ///
    /// Nothing is modified if validation fails.
    pub fn apply(&mut self, payload: &Payload<'_>) -> Result<()> {
        if let Some(existing) = self.ty.as_deref() {
            if existing != payload.ty {
                return Err(VmServiceError::load(format!(
                    "type of {} changed from `{existing}` to `{}`",
                    self.describe(),
                    payload.ty
                )));
            }
        }

        let fixed_id = payload
            .map
            .get("fixedId")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        // Once an object is known to be cacheable it stays that way.
        let can_cache = self.can_cache || fixed_id;
        let id = payload.id();
        if can_cache {
            if let Some(existing) = self.id.as_deref() {
                if Some(existing) != id {
                    return Err(VmServiceError::load(format!(
                        "id of cacheable `{}` changed from `{existing}` to `{}`",
                        payload.ty,
                        id.unwrap_or("<none>")
                    )));
                }
            }
        }

        self.ty = Some(payload.ty.to_owned());
        match payload.str("_vmType") {
            Some(raw) => self.vm_type = Some(strip_ref(raw).0.to_owned()),
            None if !payload.is_ref || self.vm_type.is_none() => {
                self.vm_type = Some(payload.ty.to_owned());
            }
            None => {}
        }
        self.can_cache = can_cache;
        if id.is_some() || !payload.is_ref {
            self.id = id.map(str::to_owned);
        }

        let name = payload.str("name");
        if name.is_some() || !payload.is_ref {
            self.name = name.map(str::to_owned);
            self.vm_name = payload.str("_vmName").or(name).map(str::to_owned);
        }

        if !payload.is_ref {
            self.loaded = true;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.id {
            Some(id) => format!("`{id}`"),
            None => "object".to_owned(),
        }
    }
}

/// Concrete model chosen for a type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectKind {
    Vm,
    Isolate,
    View,
    Event,
    Map,
}

impl ObjectKind {
    pub fn of(ty: &str) -> Self {
        match ty {
            "VM" => ObjectKind::Vm,
            "Isolate" => ObjectKind::Isolate,
            "FlutterView" => ObjectKind::View,
            "Event" => ObjectKind::Event,
            _ => ObjectKind::Map,
        }
    }
}

/// A canonical, shared handle to something the VM service describes.
///
/// Clones share state. Equality is identity: two handles are equal when they
/// point at the same cached object.
#[derive(Debug, Clone)]
pub enum ServiceObject {
    Vm(Vm),
    Isolate(Isolate),
    View(FlutterView),
    Event(ServiceEvent),
    Map(ServiceMap),
}

impl PartialEq for ServiceObject {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ServiceObject::Vm(a), ServiceObject::Vm(b)) => a.ptr_eq(b),
            (ServiceObject::Isolate(a), ServiceObject::Isolate(b)) => a.ptr_eq(b),
            (ServiceObject::View(a), ServiceObject::View(b)) => a.ptr_eq(b),
            (ServiceObject::Event(a), ServiceObject::Event(b)) => a.ptr_eq(b),
            (ServiceObject::Map(a), ServiceObject::Map(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl ServiceObject {
    /// Builds a fresh, uncached object from `map`.
    ///
    /// Canonical instances come from [`Owner::get_from_map`] instead.
    pub fn from_map(owner: &Owner, map: &JsonMap) -> Result<ServiceObject> {
        let payload = Payload::classify(map)?;
        Self::build(owner, &payload)
    }

    /// Like [`ServiceObject::from_map`]; `null` yields `None`.
    pub fn from_value(owner: &Owner, value: &Value) -> Result<Option<ServiceObject>> {
        match value {
            Value::Null => Ok(None),
            Value::Object(map) => Self::from_map(owner, map).map(Some),
            other => Err(VmServiceError::load(format!(
                "expected a service object, got {other}"
            ))),
        }
    }

    pub(crate) fn build(owner: &Owner, payload: &Payload<'_>) -> Result<ServiceObject> {
        let object = match ObjectKind::of(payload.ty) {
            ObjectKind::Event => {
                return ServiceEvent::from_payload(owner, payload).map(ServiceObject::Event)
            }
            ObjectKind::Isolate => ServiceObject::Isolate(Isolate::new(owner.vm_weak())),
            ObjectKind::View => ServiceObject::View(FlutterView::new(owner.vm_weak())),
            ObjectKind::Vm | ObjectKind::Map => ServiceObject::Map(ServiceMap::new(owner.downgrade())),
        };
        object.apply(payload)?;
        Ok(object)
    }

    fn header(&self) -> ObjectHeader {
        match self {
            ServiceObject::Vm(vm) => vm.header(),
            ServiceObject::Isolate(isolate) => isolate.header(),
            ServiceObject::View(view) => view.header(),
            ServiceObject::Event(event) => event.header().clone(),
            ServiceObject::Map(map) => map.header(),
        }
    }

    pub fn id(&self) -> Option<String> {
        self.header().id
    }

    /// The type tag with any reference marker removed.
    pub fn ty(&self) -> Option<String> {
        self.header().ty
    }

    pub fn vm_type(&self) -> Option<String> {
        self.header().vm_type
    }

    pub fn name(&self) -> Option<String> {
        self.header().name
    }

    pub fn vm_name(&self) -> Option<String> {
        self.header().vm_name
    }

    pub fn can_cache(&self) -> bool {
        self.header().can_cache
    }

    pub fn loaded(&self) -> bool {
        self.header().loaded
    }

    /// Scripts never change once loaded; a reload produces new script ids.
    pub fn is_immutable(&self) -> bool {
        matches!(self, ServiceObject::Map(_)) && self.ty().as_deref() == Some("Script")
    }

    pub fn as_isolate(&self) -> Option<&Isolate> {
        match self {
            ServiceObject::Isolate(isolate) => Some(isolate),
            _ => None,
        }
    }

    pub fn as_view(&self) -> Option<&FlutterView> {
        match self {
            ServiceObject::View(view) => Some(view),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ServiceMap> {
        match self {
            ServiceObject::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&ServiceEvent> {
        match self {
            ServiceObject::Event(event) => Some(event),
            _ => None,
        }
    }

    /// Applies a wire payload to this object in place.
    pub fn update(&self, map: &JsonMap) -> Result<()> {
        let payload = Payload::classify(map)?;
        self.apply(&payload)
    }

    pub(crate) fn apply(&self, payload: &Payload<'_>) -> Result<()> {
        match self {
            ServiceObject::Vm(vm) => vm.apply(payload),
            ServiceObject::Isolate(isolate) => isolate.apply(payload),
            ServiceObject::View(view) => view.apply(payload),
            ServiceObject::Map(map) => map.apply(payload),
            ServiceObject::Event(_) => Err(VmServiceError::load(
                "service events cannot be updated after construction",
            )),
        }
    }

    /// The owner that canonicalizes objects derived from this one.
    pub fn owner(&self) -> Result<Owner> {
        match self {
            ServiceObject::Vm(vm) => Ok(Owner::Vm(vm.clone())),
            ServiceObject::Isolate(isolate) => isolate.vm().map(Owner::Vm),
            ServiceObject::View(view) => view.vm().map(Owner::Vm),
            ServiceObject::Event(event) => event.owner(),
            ServiceObject::Map(map) => map.owner(),
        }
    }

    fn reload_slot(&self) -> Option<&ReloadSlot> {
        match self {
            ServiceObject::Vm(vm) => Some(vm.reload_slot()),
            ServiceObject::Isolate(isolate) => Some(isolate.reload_slot()),
            ServiceObject::View(view) => Some(view.reload_slot()),
            ServiceObject::Map(map) => Some(map.reload_slot()),
            ServiceObject::Event(_) => None,
        }
    }

    fn skips_reload(&self) -> bool {
        match self {
            // The VM has no id but can always be fetched.
            ServiceObject::Vm(_) => false,
            ServiceObject::Event(_) => true,
            _ => {
                let header = self.header();
                header.id.is_none() || (self.is_immutable() && header.loaded)
            }
        }
    }

    /// Fetches the full state of this object.
    ///
    /// Concurrent callers share one fetch and all observe its outcome. When
    /// the VM answers with a sentinel, a new object built from the sentinel is
    /// returned and this one is left untouched.
    pub async fn reload(&self) -> Result<ServiceObject> {
        if self.skips_reload() {
            return Ok(self.clone());
        }
        let Some(slot) = self.reload_slot() else {
            return Ok(self.clone());
        };

        let (rx, leader) = slot.join();
        if leader {
            let this = self.clone();
            let fetch = self.fetch();
            tokio::spawn(async move {
                let result = fetch.await;
                if let Some(slot) = this.reload_slot() {
                    slot.complete(result);
                }
            });
        }

        rx.await.map_err(|_| VmServiceError::Detached)?
    }

    fn fetch(&self) -> BoxFuture<'static, Result<ServiceObject>> {
        let this = self.clone();
        Box::pin(async move {
            let (owner, method, params) = match &this {
                ServiceObject::Vm(vm) => (Owner::Vm(vm.clone()), "getVM", JsonMap::new()),
                ServiceObject::Isolate(isolate) => {
                    (Owner::Isolate(isolate.clone()), "getIsolate", JsonMap::new())
                }
                ServiceObject::View(_) | ServiceObject::Map(_) => {
                    let mut params = JsonMap::new();
                    params.insert("objectId".to_owned(), json!(this.id()));
                    (this.owner()?, "getObject", params)
                }
                ServiceObject::Event(_) => return Ok(this),
            };

            let response = owner
                .invoke_rpc_raw(method, params, CallOptions::default().strict())
                .await?
                .ok_or_else(|| VmServiceError::load(format!("`{method}` returned no payload")))?;
            let payload = Payload::classify(&response)?;

            if payload.ty == SENTINEL_TYPE {
                tracing::debug!(target: "tether.vm", id = ?this.id(), "object was collected");
                return ServiceObject::build(&this.owner()?, &payload);
            }

            this.apply(&payload)?;
            Ok(this)
        })
    }

    /// A compact JSON rendering: a reference for most objects.
    pub fn to_json(&self) -> Value {
        let header = self.header();
        let mut map = JsonMap::new();
        if let Some(ty) = &header.ty {
            map.insert("type".to_owned(), json!(format!("@{ty}")));
        }
        if let Some(id) = &header.id {
            map.insert("id".to_owned(), json!(id));
        }
        if let Some(name) = &header.name {
            map.insert("name".to_owned(), json!(name));
        }
        if let ServiceObject::Event(event) = self {
            map.insert("kind".to_owned(), json!(event.kind().as_str()));
        }
        Value::Object(map)
    }
}

/// An object that canonicalizes the payloads it is handed.
#[derive(Debug, Clone)]
pub enum Owner {
    Vm(Vm),
    Isolate(Isolate),
}

impl Owner {
    /// Returns the canonical instance for `map`, creating and caching it if
    /// needed.
    pub fn get_from_map(&self, map: &JsonMap) -> Result<ServiceObject> {
        match self {
            Owner::Vm(vm) => vm.get_from_map(map),
            Owner::Isolate(isolate) => isolate.get_from_map(map),
        }
    }

    /// Like [`Owner::get_from_map`]; `null` yields `None`.
    pub fn get_from_value(&self, value: &Value) -> Result<Option<ServiceObject>> {
        match value {
            Value::Null => Ok(None),
            Value::Object(map) => self.get_from_map(map).map(Some),
            other => Err(VmServiceError::load(format!(
                "expected a service object, got {other}"
            ))),
        }
    }

    /// Replaces nested protocol objects in `value` with canonical instances.
    pub fn upgrade(&self, value: &mut ServiceValue) -> Result<()> {
        upgrade(self, value)
    }

    pub fn vm(&self) -> Result<Vm> {
        match self {
            Owner::Vm(vm) => Ok(vm.clone()),
            Owner::Isolate(isolate) => isolate.vm(),
        }
    }

    pub async fn invoke_rpc_raw(
        &self,
        method: &str,
        params: JsonMap,
        options: CallOptions,
    ) -> Result<Option<JsonMap>> {
        match self {
            Owner::Vm(vm) => vm.invoke_rpc_raw(method, params, options).await,
            Owner::Isolate(isolate) => isolate.invoke_rpc_raw(method, params, options).await,
        }
    }

    pub(crate) fn vm_weak(&self) -> Weak<VmState> {
        match self {
            Owner::Vm(vm) => vm.downgrade(),
            Owner::Isolate(isolate) => isolate.vm_weak(),
        }
    }

    pub(crate) fn downgrade(&self) -> OwnerRef {
        match self {
            Owner::Vm(vm) => OwnerRef::Vm(vm.downgrade()),
            Owner::Isolate(isolate) => OwnerRef::Isolate(isolate.downgrade()),
        }
    }
}

/// Non-owning link from a child back to its owner.
#[derive(Debug, Clone)]
pub(crate) enum OwnerRef {
    Vm(Weak<VmState>),
    Isolate(Weak<IsolateState>),
}

impl OwnerRef {
    pub fn upgrade(&self) -> Result<Owner> {
        match self {
            OwnerRef::Vm(weak) => Vm::from_weak(weak).map(Owner::Vm),
            OwnerRef::Isolate(weak) => Isolate::from_weak(weak).map(Owner::Isolate),
        }
    }
}

type ReloadWaiter = oneshot::Sender<Result<ServiceObject>>;

/// Tracks the single in-flight fetch of an object and everyone waiting on it.
#[derive(Debug, Default)]
pub(crate) struct ReloadSlot {
    waiters: Mutex<Option<Vec<ReloadWaiter>>>,
}

impl ReloadSlot {
    /// Registers a waiter. The second value is `true` for the caller that
    /// must start the fetch.
    pub fn join(&self) -> (oneshot::Receiver<Result<ServiceObject>>, bool) {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock();
        match waiters.as_mut() {
            Some(list) => {
                list.push(tx);
                (rx, false)
            }
            None => {
                *waiters = Some(vec![tx]);
                (rx, true)
            }
        }
    }

    pub fn complete(&self, result: Result<ServiceObject>) {
        let waiters = self.waiters.lock().take().unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> bool {
        self.waiters.lock().is_some()
    }
}

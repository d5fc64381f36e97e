//! Service events and per-stream fan-out.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, OnceCell};

use crate::error::{Result, VmServiceError};
use crate::isolate::Isolate;
use crate::object::{ObjectHeader, Owner, OwnerRef, Payload};
use crate::value::{upgrade_entries, ServiceValue};
use crate::vm::{Vm, VmState};
use crate::JsonMap;

/// Names of the event streams a client can listen to.
pub mod streams {
    pub const VM: &str = "VM";
    pub const ISOLATE: &str = "Isolate";
    pub const DEBUG: &str = "Debug";
    pub const GC: &str = "GC";
    pub const TIMELINE: &str = "Timeline";
    pub const LOGGING: &str = "_Logging";
    pub const EXTENSION: &str = "Extension";
    pub const STDOUT: &str = "Stdout";
    pub const STDERR: &str = "Stderr";
}

macro_rules! event_kinds {
    ($($variant:ident => $wire:literal,)*) => {
        /// The `kind` of a service event.
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum EventKind {
            $($variant,)*
            /// A kind this client does not model.
            Other(String),
        }

        impl EventKind {
            pub fn from_wire(kind: &str) -> Self {
                match kind {
                    $($wire => EventKind::$variant,)*
                    other => EventKind::Other(other.to_owned()),
                }
            }

            pub fn as_str(&self) -> &str {
                match self {
                    $(EventKind::$variant => $wire,)*
                    EventKind::Other(kind) => kind.as_str(),
                }
            }
        }
    };
}

event_kinds! {
    VmUpdate => "VMUpdate",
    IsolateStart => "IsolateStart",
    IsolateRunnable => "IsolateRunnable",
    IsolateExit => "IsolateExit",
    IsolateUpdate => "IsolateUpdate",
    IsolateReload => "IsolateReload",
    IsolateSpawn => "IsolateSpawn",
    ServiceExtensionAdded => "ServiceExtensionAdded",
    PauseStart => "PauseStart",
    PauseExit => "PauseExit",
    PauseBreakpoint => "PauseBreakpoint",
    PauseInterrupted => "PauseInterrupted",
    PauseException => "PauseException",
    PausePostRequest => "PausePostRequest",
    NoneKind => "None",
    Resume => "Resume",
    BreakpointAdded => "BreakpointAdded",
    BreakpointResolved => "BreakpointResolved",
    BreakpointRemoved => "BreakpointRemoved",
    Graph => "_Graph",
    Gc => "GC",
    Inspect => "Inspect",
    DebuggerSettingsUpdate => "_DebuggerSettingsUpdate",
    ConnectionClosed => "ConnectionClosed",
    Logging => "_Logging",
    Extension => "Extension",
}

impl EventKind {
    /// Whether the isolate is paused after this event. `None` counts: it is
    /// reported for an isolate that is paused for no particular reason.
    pub fn is_pause_event(&self) -> bool {
        matches!(
            self,
            EventKind::PauseStart
                | EventKind::PauseExit
                | EventKind::PauseBreakpoint
                | EventKind::PauseInterrupted
                | EventKind::PauseException
                | EventKind::PausePostRequest
                | EventKind::NoneKind
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct EventData {
    header: ObjectHeader,
    owner: OwnerRef,
    vm: Weak<VmState>,
    kind: EventKind,
    timestamp: Option<i64>,
    isolate_id: Option<String>,
    extension_kind: Option<String>,
    extension_data: Option<Value>,
    extension_rpc: Option<String>,
    timeline_events: Option<Vec<Value>>,
    entries: BTreeMap<String, ServiceValue>,
}

/// An event delivered on one of the VM's streams. Events are never cached.
///
/// The isolate an event concerns is kept as an id and resolved through the
/// VM on demand.
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    inner: Arc<EventData>,
}

impl ServiceEvent {
    pub fn from_map(owner: &Owner, map: &JsonMap) -> Result<Self> {
        let payload = Payload::classify(map)?;
        Self::from_payload(owner, &payload)
    }

    pub(crate) fn from_payload(owner: &Owner, payload: &Payload<'_>) -> Result<Self> {
        let mut header = ObjectHeader::default();
        header.apply(payload)?;

        let kind = payload
            .str("kind")
            .map(EventKind::from_wire)
            .ok_or_else(|| VmServiceError::load("event has no kind"))?;

        let isolate_id = payload
            .map
            .get("isolate")
            .and_then(|isolate| isolate.get("id"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| match owner {
                Owner::Isolate(isolate) => isolate.id(),
                Owner::Vm(_) => None,
            });

        let (extension_kind, extension_data) = match payload.str("extensionKind") {
            Some(kind) => (
                Some(kind.to_owned()),
                payload.map.get("extensionData").cloned(),
            ),
            None => (None, None),
        };

        let timeline_events = payload
            .map
            .get("timelineEvents")
            .and_then(Value::as_array)
            .cloned();

        // The isolate link stays an id; everything else is canonicalized.
        let entries = upgrade_entries(owner, payload.map, &["isolate"])?;

        Ok(Self {
            inner: Arc::new(EventData {
                header,
                owner: owner.downgrade(),
                vm: owner.vm_weak(),
                kind,
                timestamp: payload.map.get("timestamp").and_then(Value::as_i64),
                isolate_id,
                extension_kind,
                extension_data,
                extension_rpc: payload.str("extensionRPC").map(str::to_owned),
                timeline_events,
                entries,
            }),
        })
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn header(&self) -> &ObjectHeader {
        &self.inner.header
    }

    pub fn kind(&self) -> &EventKind {
        &self.inner.kind
    }

    pub fn is_pause_event(&self) -> bool {
        self.inner.kind.is_pause_event()
    }

    /// Milliseconds since the epoch, as reported by the VM.
    pub fn timestamp(&self) -> Option<i64> {
        self.inner.timestamp
    }

    pub fn isolate_id(&self) -> Option<&str> {
        self.inner.isolate_id.as_deref()
    }

    /// The isolate this event concerns, if it is still known to the VM.
    pub fn isolate(&self) -> Option<Isolate> {
        let vm = Vm::from_weak(&self.inner.vm).ok()?;
        vm.isolate(self.isolate_id()?)
    }

    pub fn extension_kind(&self) -> Option<&str> {
        self.inner.extension_kind.as_deref()
    }

    pub fn extension_data(&self) -> Option<&Value> {
        self.inner.extension_data.as_ref()
    }

    /// Name of the extension announced by a `ServiceExtensionAdded` event.
    pub fn extension_rpc(&self) -> Option<&str> {
        self.inner.extension_rpc.as_deref()
    }

    pub fn timeline_events(&self) -> Option<&[Value]> {
        self.inner.timeline_events.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&ServiceValue> {
        self.inner.entries.get(key)
    }

    pub fn entries(&self) -> &BTreeMap<String, ServiceValue> {
        &self.inner.entries
    }

    pub(crate) fn owner(&self) -> Result<Owner> {
        self.inner.owner.upgrade()
    }
}

/// Lazily created broadcast channels, one per stream id.
#[derive(Debug)]
pub(crate) struct EventHub {
    capacity: usize,
    senders: Mutex<HashMap<String, broadcast::Sender<ServiceEvent>>>,
    listened: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            senders: Mutex::new(HashMap::new()),
            listened: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, stream_id: &str) -> broadcast::Receiver<ServiceEvent> {
        self.senders
            .lock()
            .entry(stream_id.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// The listen state of `stream_id`. It is initialized once the VM has
    /// accepted `streamListen`; concurrent first subscribers wait on the same
    /// cell, and a failed listen leaves it empty for the next one.
    pub fn listen_state(&self, stream_id: &str) -> Arc<OnceCell<()>> {
        self.listened
            .lock()
            .entry(stream_id.to_owned())
            .or_default()
            .clone()
    }

    pub fn publish(&self, stream_id: &str, event: ServiceEvent) {
        let sender = self.senders.lock().get(stream_id).cloned();
        if let Some(sender) = sender {
            // No receivers is fine.
            let _ = sender.send(event);
        }
    }
}

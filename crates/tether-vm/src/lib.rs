//! Client-side object model for the VM service protocol.
//!
//! [`VmService::connect`] opens a JSON-RPC connection and exposes the VM as a
//! graph of live handles: [`Vm`], [`Isolate`], [`FlutterView`] and generic
//! [`ServiceMap`]s. Handles are canonical. Loading the same object id twice
//! yields the same handle, and payloads arriving later (from calls or stream
//! events) update it in place.
//!
//! Handles only hold weak references to the VM. Once the [`VmService`] and
//! every [`Vm`] clone are dropped, calls through leftover handles fail with
//! [`VmServiceError::Detached`].

use serde_json::Value;
use url::Url;

mod devfs;
mod error;
mod event;
mod extensions;
mod heap;
mod invoke;
mod isolate;
mod map;
mod object;
mod program;
mod service;
mod value;
mod view;
mod vm;

pub use error::{Result, VmServiceError, RELOAD_BARRED};
pub use event::{streams, EventKind, ServiceEvent};
pub use heap::HeapSpace;
pub use invoke::{CallOptions, TimeoutTier};
pub use isolate::Isolate;
pub use map::ServiceMap;
pub use object::{Owner, ServiceObject, SENTINEL_TYPE};
pub use program::ProgramElement;
pub use service::{websocket_uri, ConnectOptions, ReloadSourcesHandler, VmService};
pub use value::ServiceValue;
pub use view::FlutterView;
pub use vm::{Vm, VmStats};

pub type JsonMap = serde_json::Map<String, Value>;

/// Renders a uri as a path the VM can open; non-file uris pass through.
pub(crate) fn file_path_param(uri: &Url) -> String {
    match uri.to_file_path() {
        Ok(path) => path.display().to_string(),
        Err(()) => uri.to_string(),
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::Result;
use crate::object::{ObjectHeader, Owner, OwnerRef, Payload, ReloadSlot, ServiceObject};
use crate::value::{upgrade_entries, ServiceValue};

#[derive(Debug)]
struct MapState {
    owner: OwnerRef,
    header: Mutex<ObjectHeader>,
    entries: Mutex<BTreeMap<String, ServiceValue>>,
    reload: ReloadSlot,
}

/// Fallback model for every type without a dedicated one: the identity
/// fields plus the upgraded payload entries.
#[derive(Debug, Clone)]
pub struct ServiceMap {
    inner: Arc<MapState>,
}

impl ServiceMap {
    pub(crate) fn new(owner: OwnerRef) -> Self {
        Self {
            inner: Arc::new(MapState {
                owner,
                header: Mutex::new(ObjectHeader::default()),
                entries: Mutex::new(BTreeMap::new()),
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

    pub fn id(&self) -> Option<String> {
        self.inner.header.lock().id.clone()
    }

    pub fn ty(&self) -> Option<String> {
        self.inner.header.lock().ty.clone()
    }

    pub fn name(&self) -> Option<String> {
        self.inner.header.lock().name.clone()
    }

    pub fn loaded(&self) -> bool {
        self.inner.header.lock().loaded
    }

    pub fn owner(&self) -> Result<Owner> {
        self.inner.owner.upgrade()
    }

    pub fn get(&self, key: &str) -> Option<ServiceValue> {
        self.inner.entries.lock().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.lock().keys().cloned().collect()
    }

    pub fn entries(&self) -> BTreeMap<String, ServiceValue> {
        self.inner.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    pub fn to_json(&self) -> Value {
        ServiceValue::Map(self.entries()).to_json()
    }

    pub async fn reload(&self) -> Result<ServiceObject> {
        ServiceObject::Map(self.clone()).reload().await
    }

    pub(crate) fn apply(&self, payload: &Payload<'_>) -> Result<()> {
        let was_loaded = {
            let mut header = self.inner.header.lock();
            let was_loaded = header.loaded;
            header.apply(payload)?;
            was_loaded
        };

        let owner = self.owner()?;
        let upgraded = upgrade_entries(&owner, payload.map, &[])?;

        let mut entries = self.inner.entries.lock();
        if payload.is_ref && was_loaded {
            // A reference must not throw away what a full load brought in.
            entries.extend(upgraded.into_iter().filter(|(key, _)| key != "type"));
        } else {
            *entries = upgraded;
        }
        Ok(())
    }
}

use std::collections::BTreeMap;

use serde_json::{Number, Value};

use crate::error::Result;
use crate::object::{Owner, ServiceObject};
use crate::JsonMap;

/// A JSON value whose nested protocol objects may have been replaced by
/// canonical [`ServiceObject`] handles.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<ServiceValue>),
    Map(BTreeMap<String, ServiceValue>),
    Object(ServiceObject),
}

impl ServiceValue {
    /// Converts raw JSON without canonicalizing anything.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ServiceValue::Null,
            Value::Bool(b) => ServiceValue::Bool(*b),
            Value::Number(n) => ServiceValue::Number(n.clone()),
            Value::String(s) => ServiceValue::String(s.clone()),
            Value::Array(items) => ServiceValue::List(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => ServiceValue::Map(
                map.iter()
                    .map(|(key, value)| (key.clone(), Self::from_json(value)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ServiceValue::Null => Value::Null,
            ServiceValue::Bool(b) => Value::Bool(*b),
            ServiceValue::Number(n) => Value::Number(n.clone()),
            ServiceValue::String(s) => Value::String(s.clone()),
            ServiceValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            ServiceValue::Map(map) => Value::Object(map_to_json(map)),
            ServiceValue::Object(object) => object.to_json(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ServiceValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ServiceValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ServiceValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ServiceValue]> {
        match self {
            ServiceValue::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ServiceValue>> {
        match self {
            ServiceValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ServiceObject> {
        match self {
            ServiceValue::Object(object) => Some(object),
            _ => None,
        }
    }
}

fn map_to_json(map: &BTreeMap<String, ServiceValue>) -> JsonMap {
    map.iter()
        .map(|(key, value)| (key.clone(), value.to_json()))
        .collect()
}

fn is_protocol_object(map: &BTreeMap<String, ServiceValue>) -> bool {
    matches!(map.get("type"), Some(ServiceValue::String(_)))
}

/// Replaces, in place, every nested mapping that carries a type tag with the
/// owner's canonical object for it.
///
/// Canonical objects are not descended into, so upgrading an already
/// upgraded value changes nothing.
pub(crate) fn upgrade(owner: &Owner, value: &mut ServiceValue) -> Result<()> {
    let raw = match value {
        ServiceValue::Map(map) if is_protocol_object(map) => Some(map_to_json(map)),
        _ => None,
    };
    if let Some(raw) = raw {
        *value = ServiceValue::Object(owner.get_from_map(&raw)?);
        return Ok(());
    }

    match value {
        ServiceValue::Map(map) => {
            for entry in map.values_mut() {
                upgrade(owner, entry)?;
            }
        }
        ServiceValue::List(items) => {
            for item in items.iter_mut() {
                upgrade(owner, item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

pub(crate) fn upgrade_json(owner: &Owner, value: &Value) -> Result<ServiceValue> {
    let mut upgraded = ServiceValue::from_json(value);
    upgrade(owner, &mut upgraded)?;
    Ok(upgraded)
}

/// Upgrades every entry of a payload except the keys in `skip`.
pub(crate) fn upgrade_entries(
    owner: &Owner,
    map: &JsonMap,
    skip: &[&str],
) -> Result<BTreeMap<String, ServiceValue>> {
    let mut entries = BTreeMap::new();
    for (key, value) in map {
        if skip.contains(&key.as_str()) {
            continue;
        }
        entries.insert(key.clone(), upgrade_json(owner, value)?);
    }
    Ok(entries)
}

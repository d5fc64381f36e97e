//! Mapping program elements changed by a reload back to source locations.

use std::fmt;

use futures_util::future::try_join_all;
use serde_json::{json, Value};
use url::Url;

use crate::error::{Result, VmServiceError};
use crate::invoke::CallOptions;
use crate::isolate::Isolate;
use crate::object::strip_ref;
use crate::JsonMap;

/// A named program element and where it is defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramElement {
    pub qualified_name: String,
    pub uri: Url,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl ProgramElement {
    pub fn new(qualified_name: impl Into<String>, uri: Url) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            uri,
            line: None,
            column: None,
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

impl fmt::Display for ProgramElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} ({}:{line})", self.qualified_name, self.uri),
            None => write!(f, "{} ({})", self.qualified_name, self.uri),
        }
    }
}

/// Prefixes `name` with its owners' names up to, not including, the library.
pub(crate) fn qualified_name(element: &JsonMap) -> String {
    let mut name = element
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let mut owner = element.get("_owner").and_then(Value::as_object);
    while let Some(current) = owner {
        let ty = current.get("type").and_then(Value::as_str).unwrap_or_default();
        if strip_ref(ty).0 == "Library" {
            break;
        }
        let owner_name = current
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        name = format!("{owner_name}.{name}");
        owner = current.get("_owner").and_then(Value::as_object);
    }
    name
}

/// Finds `token_pos` in a script's `tokenPosTable`.
///
/// Each row is `[line, tokenPos, column, tokenPos, column, ...]`.
pub(crate) fn find_token_pos(table: &[Value], token_pos: i64) -> Option<(u32, u32)> {
    for row in table {
        let Some(row) = row.as_array() else {
            continue;
        };
        let Some(line) = row.first().and_then(Value::as_i64) else {
            continue;
        };
        for pair in row[1..].chunks_exact(2) {
            if pair[0].as_i64() == Some(token_pos) {
                let column = pair[1].as_i64()?;
                return Some((u32::try_from(line).ok()?, u32::try_from(column).ok()?));
            }
        }
    }
    None
}

/// Parses a script uri; a uri without a scheme is a local file path.
pub(crate) fn script_uri(raw: &str) -> Result<Url> {
    match Url::parse(raw) {
        Ok(uri) => Ok(uri),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let path = if raw.starts_with('/') {
                format!("file://{raw}")
            } else {
                format!("file:///{raw}")
            };
            Url::parse(&path)
                .map_err(|err| VmServiceError::load(format!("invalid script uri `{raw}`: {err}")))
        }
        Err(err) => Err(VmServiceError::load(format!(
            "invalid script uri `{raw}`: {err}"
        ))),
    }
}

fn object<'a>(map: &'a JsonMap, key: &str) -> Result<&'a JsonMap> {
    map.get(key)
        .and_then(Value::as_object)
        .ok_or_else(|| VmServiceError::load(format!("missing `{key}`")))
}

impl Isolate {
    /// Program elements changed by the last reload that have not run since.
    pub async fn get_unused_changes_in_last_reload(&self) -> Result<Vec<ProgramElement>> {
        let response = self
            .invoke_rpc_raw(
                "_getUnusedChangesInLastReload",
                JsonMap::new(),
                CallOptions::default().strict(),
            )
            .await?
            .unwrap_or_default();
        let unused = response
            .get("unused")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        try_join_all(unused.iter().map(|element| async move {
            let element = element
                .as_object()
                .ok_or_else(|| VmServiceError::load("unused element is not an object"))?;
            self.describe_element(element).await
        }))
        .await
    }

    async fn fetch_raw(&self, object_id: &str) -> Result<JsonMap> {
        let mut params = JsonMap::new();
        params.insert("objectId".to_owned(), json!(object_id));
        self.invoke_rpc_raw("getObject", params, CallOptions::default().strict())
            .await?
            .ok_or_else(|| VmServiceError::load(format!("no payload for `{object_id}`")))
    }

    async fn describe_element(&self, element: &JsonMap) -> Result<ProgramElement> {
        let name = qualified_name(element);
        let element_id = element
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| VmServiceError::load(format!("element `{name}` has no id")))?;

        let fuller = self.fetch_raw(element_id).await?;
        let location = object(&fuller, "location")?;
        let token_pos = location.get("tokenPos").and_then(Value::as_i64);
        let script_id = object(location, "script")?
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| VmServiceError::load("script reference has no id"))?;

        let script = self.fetch_raw(script_id).await?;
        let uri = script_uri(
            script
                .get("uri")
                .and_then(Value::as_str)
                .ok_or_else(|| VmServiceError::load("script has no uri"))?,
        )?;

        let table = script
            .get("tokenPosTable")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let element = ProgramElement::new(name, uri);
        Ok(match token_pos.and_then(|pos| find_token_pos(table, pos)) {
            Some((line, column)) => element.at(line, column),
            None => element,
        })
    }
}

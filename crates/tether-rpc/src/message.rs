//! JSON-RPC 2.0 message framing.

use serde_json::{json, Map, Value};

use crate::error::{codes, RpcErrorObject, RpcTransportError};

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: Value,
        result: Result<Value, RpcErrorObject>,
    },
}

impl Message {
    pub fn parse(text: &str) -> Result<Self, RpcTransportError> {
        let value: Value = serde_json::from_str(text).map_err(|err| RpcTransportError::Protocol {
            message: format!("invalid JSON: {err}"),
        })?;
        let Value::Object(mut obj) = value else {
            return Err(RpcTransportError::Protocol {
                message: "message is not a JSON object".to_owned(),
            });
        };

        let id = obj.remove("id").filter(|id| !id.is_null());
        if let Some(Value::String(method)) = obj.remove("method") {
            let params = obj.remove("params").unwrap_or(Value::Null);
            return Ok(match id {
                Some(id) => Message::Request { id, method, params },
                None => Message::Notification { method, params },
            });
        }

        let Some(id) = id else {
            return Err(RpcTransportError::Protocol {
                message: "message has neither method nor id".to_owned(),
            });
        };

        if let Some(error) = obj.remove("error") {
            let error: RpcErrorObject =
                serde_json::from_value(error).unwrap_or_else(|err| RpcErrorObject {
                    code: codes::INTERNAL_ERROR,
                    message: format!("malformed error object: {err}"),
                    data: None,
                });
            return Ok(Message::Response {
                id,
                result: Err(error),
            });
        }

        Ok(Message::Response {
            id,
            result: Ok(obj.remove("result").unwrap_or(Value::Null)),
        })
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".to_owned(), json!("2.0"));
        match self {
            Message::Request { id, method, params } => {
                obj.insert("id".to_owned(), id.clone());
                obj.insert("method".to_owned(), Value::String(method.clone()));
                if !params.is_null() {
                    obj.insert("params".to_owned(), params.clone());
                }
            }
            Message::Notification { method, params } => {
                obj.insert("method".to_owned(), Value::String(method.clone()));
                if !params.is_null() {
                    obj.insert("params".to_owned(), params.clone());
                }
            }
            Message::Response { id, result } => {
                obj.insert("id".to_owned(), id.clone());
                match result {
                    Ok(value) => {
                        obj.insert("result".to_owned(), value.clone());
                    }
                    Err(error) => {
                        obj.insert("error".to_owned(), json!(error));
                    }
                }
            }
        }
        Value::Object(obj)
    }

    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

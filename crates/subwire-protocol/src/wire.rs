//! JSON envelope shared by both vocabularies: `{"type", "id"?, "payload"?}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use subwire_core::{ExecutionResult, JsonMap, OperationId, ProtocolError, Result, SubscribePayload};

/// Envelope as read off the wire, before vocabulary-specific validation.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Serialize)]
struct OutEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

/// Parse the envelope of one text frame.
pub(crate) fn parse(frame: &str) -> Result<Envelope> {
    serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Serialize an envelope.
pub(crate) fn write(kind: &str, id: Option<&OperationId>, payload: Option<Value>) -> Result<String> {
    let envelope = OutEnvelope {
        kind,
        id: id.map(OperationId::as_str),
        payload,
    };
    serde_json::to_string(&envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
}

impl Envelope {
    /// Operation id; must be present and non-empty.
    pub(crate) fn require_id(&mut self) -> Result<OperationId> {
        match self.id.take() {
            Some(id) if !id.is_empty() => Ok(OperationId::from_string(id)),
            _ => Err(ProtocolError::Malformed(format!(
                "'{}' message requires a non-empty id",
                self.kind
            ))),
        }
    }

    /// Optional auxiliary payload; must be an object when present.
    pub(crate) fn optional_map(&mut self) -> Result<Option<JsonMap>> {
        match self.payload.take() {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(_) => Err(ProtocolError::Malformed(format!(
                "'{}' payload must be an object",
                self.kind
            ))),
        }
    }

    /// Subscribe payload; `query` is mandatory.
    pub(crate) fn subscribe_payload(&mut self) -> Result<SubscribePayload> {
        let payload = self.required_payload()?;
        serde_json::from_value(payload)
            .map_err(|e| ProtocolError::Malformed(format!("invalid '{}' payload: {e}", self.kind)))
    }

    /// Execution result payload; must be an object.
    pub(crate) fn result_payload(&mut self) -> Result<ExecutionResult> {
        match self.required_payload()? {
            payload @ Value::Object(_) => serde_json::from_value(payload).map_err(|e| {
                ProtocolError::Malformed(format!("invalid '{}' payload: {e}", self.kind))
            }),
            _ => Err(ProtocolError::Malformed(format!(
                "'{}' payload must be an object",
                self.kind
            ))),
        }
    }

    pub(crate) fn required_payload(&mut self) -> Result<Value> {
        match self.payload.take() {
            Some(Value::Null) | None => Err(ProtocolError::Malformed(format!(
                "'{}' message requires a payload",
                self.kind
            ))),
            Some(value) => Ok(value),
        }
    }
}

/// Serialize an optional map into an optional JSON value.
pub(crate) fn map_value(map: Option<&JsonMap>) -> Option<Value> {
    map.map(|m| Value::Object(m.clone()))
}

/// Serialize any payload type.
pub(crate) fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

//! JSON-RPC 2.0 id model and body inspection helpers.
//!
//! The router correlates child responses to network requests purely by the
//! JSON-RPC `id`. The id type (integer, float, or string) must be preserved
//! exactly: two ids are equal iff their variant and value agree, so `1`,
//! `1.0`, and `"1"` are three distinct ids. Never coerce between types.
//!
//! Bodies arriving from the network are not required to be valid JSON (they
//! are forwarded to the child verbatim either way), so every helper here is
//! best-effort and total.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// JSON-RPC 2.0 request id, preserving the wire type.
///
/// Floats are accepted because routing must handle whatever a client put on
/// the wire; hashing uses the IEEE bit pattern so a float id round-trips
/// through the correlation maps unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcId {
    /// Integer id (e.g. `"id": 7`).
    Int(i64),
    /// Float id (e.g. `"id": 1.5`). Unusual but routable.
    Float(f64),
    /// String id (e.g. `"id": "x"`).
    Str(String),
}

impl Eq for JsonRpcId {}

impl std::hash::Hash for JsonRpcId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            JsonRpcId::Int(n) => {
                0u8.hash(state);
                n.hash(state);
            }
            JsonRpcId::Float(f) => {
                1u8.hash(state);
                f.to_bits().hash(state);
            }
            JsonRpcId::Str(s) => {
                2u8.hash(state);
                s.hash(state);
            }
        }
    }
}

impl std::fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsonRpcId::Int(n) => write!(f, "{n}"),
            JsonRpcId::Float(x) => write!(f, "{x}"),
            JsonRpcId::Str(s) => write!(f, "{s}"),
        }
    }
}

impl Serialize for JsonRpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcId::Int(n) => serializer.serialize_i64(*n),
            JsonRpcId::Float(f) => serializer.serialize_f64(*f),
            JsonRpcId::Str(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        from_value(&value)
            .ok_or_else(|| serde::de::Error::custom("JSON-RPC id must be a number or string"))
    }
}

/// Convert a JSON value into a [`JsonRpcId`], if it has an id-shaped type.
///
/// `null`, booleans, arrays, and objects are not routable ids.
pub fn from_value(value: &Value) -> Option<JsonRpcId> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(JsonRpcId::Int(i))
            } else {
                n.as_f64().map(JsonRpcId::Float)
            }
        }
        Value::String(s) => Some(JsonRpcId::Str(s.clone())),
        _ => None,
    }
}

/// Extract the top-level `id` from a raw body, if the body parses as a JSON
/// object carrying one.
pub fn extract_id(body: &[u8]) -> Option<JsonRpcId> {
    let value: Value = serde_json::from_slice(body).ok()?;
    from_value(value.get("id")?)
}

/// Extract `params.clientInfo.name` from an MCP `initialize` request body.
///
/// Returns `None` for anything that is not an `initialize` request with a
/// non-empty client name.
pub fn extract_initialize_client_name(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    if value.get("method")?.as_str()? != "initialize" {
        return None;
    }
    let name = value
        .get("params")?
        .get("clientInfo")?
        .get("name")?
        .as_str()?
        .trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

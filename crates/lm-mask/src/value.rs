//! Context value tree.
//!
//! Log context is a heterogeneous tree. [`Value`] models it as an exhaustive
//! sum type so every masking stage matches on the runtime type with
//! compiler-checked coverage. Maps are ordered by key.

use crate::{MaskingError, Result};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

/// A node in a log context tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A structured object carrying its class name.
    Object(ObjectValue),
    /// An opaque handle (socket, file, stream). Cannot be stringified or
    /// JSON-encoded.
    Resource(ResourceHandle),
}

/// Object value with its class name and public fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectValue {
    pub class_name: String,
    pub fields: BTreeMap<String, Value>,
}

/// Opaque resource handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub kind: String,
    pub id: u64,
}

/// Runtime type tag used to key data-type masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeTag {
    #[serde(rename = "NULL")]
    Null,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "integer")]
    Integer,
    #[serde(rename = "double")]
    Double,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "array")]
    Array,
    #[serde(rename = "object")]
    Object,
    #[serde(rename = "resource")]
    Resource,
}

impl TypeTag {
    /// All tags, in declaration order.
    pub const ALL: [TypeTag; 8] = [
        TypeTag::Null,
        TypeTag::Boolean,
        TypeTag::Integer,
        TypeTag::Double,
        TypeTag::String,
        TypeTag::Array,
        TypeTag::Object,
        TypeTag::Resource,
    ];

    /// Parse a tag name. Accepts the canonical names plus common aliases.
    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "NULL" | "null" => Some(TypeTag::Null),
            "boolean" | "bool" => Some(TypeTag::Boolean),
            "integer" | "int" => Some(TypeTag::Integer),
            "double" | "float" => Some(TypeTag::Double),
            "string" => Some(TypeTag::String),
            "array" => Some(TypeTag::Array),
            "object" => Some(TypeTag::Object),
            "resource" => Some(TypeTag::Resource),
            _ => None,
        }
    }

    /// Canonical tag name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::Null => "NULL",
            TypeTag::Boolean => "boolean",
            TypeTag::Integer => "integer",
            TypeTag::Double => "double",
            TypeTag::String => "string",
            TypeTag::Array => "array",
            TypeTag::Object => "object",
            TypeTag::Resource => "resource",
        }
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Value {
    /// Create an object value.
    pub fn object(class_name: impl Into<String>, fields: BTreeMap<String, Value>) -> Self {
        Value::Object(ObjectValue {
            class_name: class_name.into(),
            fields,
        })
    }

    /// Create a resource handle value.
    pub fn resource(kind: impl Into<String>, id: u64) -> Self {
        Value::Resource(ResourceHandle {
            kind: kind.into(),
            id,
        })
    }

    /// Runtime type tag. Lists and maps share the `array` tag.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Bool(_) => TypeTag::Boolean,
            Value::Int(_) => TypeTag::Integer,
            Value::Float(_) => TypeTag::Double,
            Value::Str(_) => TypeTag::String,
            Value::List(_) | Value::Map(_) => TypeTag::Array,
            Value::Object(_) => TypeTag::Object,
            Value::Resource(_) => TypeTag::Resource,
        }
    }

    /// Type name for diagnostics: the class name for objects, the tag otherwise.
    pub fn type_name(&self) -> String {
        match self {
            Value::Object(obj) => obj.class_name.clone(),
            other => other.type_tag().to_string(),
        }
    }

    /// Whether this is a list or a map.
    pub fn is_container(&self) -> bool {
        matches!(self, Value::List(_) | Value::Map(_))
    }

    /// Borrow the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Stringify a scalar. Containers, objects and resources have no text form.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => Some(String::new()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Str(s) => Some(s.clone()),
            Value::List(_) | Value::Map(_) | Value::Object(_) | Value::Resource(_) => None,
        }
    }

    fn child(&self, segment: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(segment),
            Value::Object(obj) => obj.fields.get(segment),
            Value::List(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    fn child_mut(&mut self, segment: &str) -> Option<&mut Value> {
        match self {
            Value::Map(map) => map.get_mut(segment),
            Value::Object(obj) => obj.fields.get_mut(segment),
            Value::List(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(move |i| items.get_mut(i)),
            _ => None,
        }
    }

    /// Resolve a dotted path (`user.email`, `items.0.id`).
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(self, |node, seg| node.child(seg))
    }

    /// Resolve a dotted path mutably.
    pub fn get_path_mut(&mut self, path: &str) -> Option<&mut Value> {
        path.split('.').try_fold(self, |node, seg| node.child_mut(seg))
    }

    /// Whether a dotted path resolves.
    pub fn has_path(&self, path: &str) -> bool {
        self.get_path(path).is_some()
    }

    /// Overwrite the value at an existing dotted path. Returns false when the
    /// path does not resolve.
    pub fn set_path(&mut self, path: &str, value: Value) -> bool {
        match self.get_path_mut(path) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Remove the value at a dotted path, returning it.
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        let (parent, last) = match path.rsplit_once('.') {
            Some((prefix, last)) => (self.get_path_mut(prefix)?, last),
            None => (self, path),
        };
        match parent {
            Value::Map(map) => map.remove(last),
            Value::Object(obj) => obj.fields.remove(last),
            Value::List(items) => {
                let idx = last.parse::<usize>().ok()?;
                (idx < items.len()).then(|| items.remove(idx))
            }
            _ => None,
        }
    }

    /// Encode as JSON. Fails for resources and non-finite floats.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| {
                    MaskingError::operation_failed(format!("float {} is not JSON-encodable", f))
                })?,
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<Result<Vec<_>>>()?,
            ),
            Value::Map(map) => serde_json::Value::Object(json_object(map)?),
            Value::Object(obj) => serde_json::Value::Object(json_object(&obj.fields)?),
            Value::Resource(res) => {
                return Err(MaskingError::operation_failed(format!(
                    "resource of type {} is not JSON-encodable",
                    res.kind
                )))
            }
        })
    }
}

fn json_object(map: &BTreeMap<String, Value>) -> Result<serde_json::Map<String, serde_json::Value>> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
        .collect()
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

/// Lenient serialization for audit export: objects serialize as their
/// fields, resources as a `resource(<kind>)` marker string.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(map) => serialize_fields(serializer, map),
            Value::Object(obj) => serialize_fields(serializer, &obj.fields),
            Value::Resource(res) => serializer.serialize_str(&format!("resource({})", res.kind)),
        }
    }
}

fn serialize_fields<S: Serializer>(
    serializer: S,
    fields: &BTreeMap<String, Value>,
) -> std::result::Result<S::Ok, S::Error> {
    let mut out = serializer.serialize_map(Some(fields.len()))?;
    for (k, v) in fields {
        out.serialize_entry(k, v)?;
    }
    out.end()
}

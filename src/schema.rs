//! Schema snapshots
//!
//! A snapshot is the JSON-Schema-shaped description of a handler's request or
//! response payload at one version:
//!
//! ```json
//! {
//!   "type": "object",
//!   "properties": {
//!     "price": { "type": "string", "description": "Decimal price" },
//!     "note":  { "type": "string", "deprecated": true }
//!   },
//!   "required": ["price"]
//! }
//! ```
//!
//! Two extension keys steer the diff engine: `x-renamed-from` on a new field
//! declares it a rename of an old one, and `x-unused` (or `deprecated`) on an
//! optional field allows removing it without a breaking change.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::checksum::ContentHash;
use crate::error::Result;

/// Annotation declaring a field as the rename of an older field
pub const RENAMED_FROM: &str = "x-renamed-from";
/// Annotation marking a field as unused by clients
pub const UNUSED: &str = "x-unused";

/// Keys that describe a field without changing its wire shape
pub(crate) const METADATA_KEYS: &[&str] = &[
    "description",
    "title",
    "examples",
    "$comment",
    "deprecated",
    UNUSED,
    RENAMED_FROM,
];

/// A named schema at one version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Name of the payload (e.g. "GetUserResponse")
    pub name: String,
    /// The schema content
    pub content: Value,
}

impl SchemaSnapshot {
    pub fn new(name: impl Into<String>, content: Value) -> Self {
        Self {
            name: name.into(),
            content,
        }
    }

    /// Load a snapshot from a JSON file; the file stem becomes the name
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self { name, content })
    }

    /// Hash of the content, the diff cache key
    pub fn hash(&self) -> ContentHash {
        ContentHash::from_json(&self.content)
    }
}

/// Properties of an object schema in declaration order
pub(crate) fn properties(schema: &Value) -> Option<&Map<String, Value>> {
    schema.get("properties").and_then(Value::as_object)
}

pub(crate) fn is_required(schema: &Value, field: &str) -> bool {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().any(|v| v.as_str() == Some(field)))
        .unwrap_or(false)
}

/// Declared type of a field, rendered for comparison and reports
pub(crate) fn type_of(field: &Value) -> Option<String> {
    match field.get("type")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(types) => {
            let mut names: Vec<&str> = types.iter().filter_map(Value::as_str).collect();
            names.sort_unstable();
            Some(names.join("|"))
        }
        other => Some(other.to_string()),
    }
}

pub(crate) fn is_unused(field: &Value) -> bool {
    [UNUSED, "deprecated"]
        .iter()
        .any(|k| field.get(*k).and_then(Value::as_bool).unwrap_or(false))
}

pub(crate) fn renamed_from(field: &Value) -> Option<&str> {
    field.get(RENAMED_FROM).and_then(Value::as_str)
}

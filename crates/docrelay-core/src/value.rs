//! Native document tree.
//!
//! Documents are ordered maps of field name to [`Value`]. Unlike JSON, the
//! native tree has a first-class [`ObjectId`] variant, so identifiers embedded
//! anywhere in a document keep their type inside a store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::types::ObjectId;

/// Name of the identity field of every document.
pub const ID_FIELD: &str = "_id";

/// A structured record: field name to value.
pub type Document = BTreeMap<String, Value>;

/// A native document value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    ObjectId(ObjectId),
    Array(Vec<Value>),
    Document(Document),
}

impl Value {
    /// The identifier, if this value is one.
    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Value::ObjectId(id) => Some(*id),
            _ => None,
        }
    }

    /// The string, if this value is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The sub-document, if this value is one.
    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::ObjectId(id)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Document(doc)
    }
}

/// Read the identity of a document.
///
/// `_id` must be a native identifier or a 24-hex string. The string form is
/// accepted here regardless of codec settings: `_id` is always an identifier.
pub fn document_id(doc: &Document) -> Result<ObjectId> {
    match doc.get(ID_FIELD) {
        None => Err(CoreError::MissingId),
        Some(Value::ObjectId(id)) => Ok(*id),
        Some(Value::String(s)) => {
            ObjectId::from_hex(s).map_err(|_| CoreError::InvalidId(s.clone()))
        }
        Some(other) => Err(CoreError::InvalidId(format!("{other:?}"))),
    }
}

/// Split a document into its identity and the remaining field set.
///
/// The returned fields never contain `_id`; appliers write them with
/// field-set semantics so the stored identity is never overwritten.
pub fn strip_id(mut doc: Document) -> Result<(ObjectId, Document)> {
    let id = document_id(&doc)?;
    doc.remove(ID_FIELD);
    Ok((id, doc))
}

//! Identifier codec: native document trees to and from JSON.
//!
//! JSON has no identifier type, so identifiers must be marked on the wire.
//! Three forms are seen in practice:
//!
//! 1. **Tagged**: `{"$oid": "507f191e810c19729de860ea"}`. The only form this
//!    codec emits, always recognized on decode.
//! 2. **Bare hex string**: any 24-hex-char string. Recognized only when
//!    [`CodecConfig::legacy_hex_strings`] is set. This is lossy: a genuine
//!    string field that happens to be 24 hex chars comes back as an
//!    identifier.
//! 3. **Native**: a [`Value::ObjectId`] already in a native tree passes
//!    through [`IdentifierCodec::revive`] unchanged.
//!
//! Traversal recurses through arrays and maps and is bounded by
//! [`CodecConfig::max_depth`]; deeper input fails with
//! [`CoreError::MalformedPayload`].
//!
//! Encoding refuses what would not survive a round trip: non-finite floats
//! and native maps carrying a `$oid` key.

use serde_json::{Map, Number, Value as Json};

use crate::error::{CoreError, Result};
use crate::types::ObjectId;
use crate::value::{Document, Value};

/// Key of the tagged identifier form.
pub const OID_TAG: &str = "$oid";

/// Codec settings.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Reinterpret bare 24-hex strings as identifiers on decode.
    pub legacy_hex_strings: bool,
    /// Maximum nesting of arrays and maps.
    pub max_depth: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            legacy_hex_strings: false,
            max_depth: 64,
        }
    }
}

/// Converts native trees to transport JSON and back.
#[derive(Debug, Clone, Default)]
pub struct IdentifierCodec {
    config: CodecConfig,
}

impl IdentifierCodec {
    /// Create a codec with the given settings.
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Codec that also accepts bare hex strings as identifiers.
    pub fn legacy() -> Self {
        Self::new(CodecConfig {
            legacy_hex_strings: true,
            ..CodecConfig::default()
        })
    }

    /// The active settings.
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Encode a native value to its wire form.
    pub fn encode(&self, value: &Value) -> Result<Json> {
        self.encode_at(value, 0)
    }

    /// Encode a document to a JSON object.
    pub fn encode_document(&self, doc: &Document) -> Result<Json> {
        self.encode_map(doc, 0)
    }

    /// Decode a wire value into a native value.
    pub fn decode(&self, json: &Json) -> Result<Value> {
        self.decode_at(json, 0)
    }

    /// Decode a wire value that must be a JSON object.
    pub fn decode_document(&self, json: &Json) -> Result<Document> {
        match self.decode(json)? {
            Value::Document(doc) => Ok(doc),
            other => Err(CoreError::MalformedPayload(format!(
                "expected a document, got {}",
                kind_name(&other)
            ))),
        }
    }

    /// Normalize a native tree that may still carry tagged sub-documents or
    /// (with legacy decoding on) bare hex strings.
    pub fn revive(&self, value: Value) -> Result<Value> {
        self.revive_at(value, 0)
    }

    fn check_depth(&self, depth: usize) -> Result<()> {
        if depth > self.config.max_depth {
            return Err(CoreError::MalformedPayload(format!(
                "nesting deeper than {}",
                self.config.max_depth
            )));
        }
        Ok(())
    }

    fn encode_at(&self, value: &Value, depth: usize) -> Result<Json> {
        self.check_depth(depth)?;
        Ok(match value {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::Number((*n).into()),
            Value::Float(f) => Number::from_f64(*f).map(Json::Number).ok_or_else(|| {
                CoreError::MalformedPayload(format!("{f} has no JSON representation"))
            })?,
            Value::String(s) => Json::String(s.clone()),
            Value::ObjectId(id) => tagged(id),
            Value::Array(items) => Json::Array(
                items
                    .iter()
                    .map(|item| self.encode_at(item, depth + 1))
                    .collect::<Result<_>>()?,
            ),
            Value::Document(doc) => self.encode_map(doc, depth)?,
        })
    }

    fn encode_map(&self, doc: &Document, depth: usize) -> Result<Json> {
        self.check_depth(depth)?;
        if doc.contains_key(OID_TAG) {
            return Err(CoreError::MalformedPayload(format!(
                "{OID_TAG} is reserved for identifiers"
            )));
        }
        let mut map = Map::with_capacity(doc.len());
        for (key, value) in doc {
            map.insert(key.clone(), self.encode_at(value, depth + 1)?);
        }
        Ok(Json::Object(map))
    }

    fn decode_at(&self, json: &Json, depth: usize) -> Result<Value> {
        self.check_depth(depth)?;
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => self.decode_string(s),
            Json::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.decode_at(item, depth + 1))
                    .collect::<Result<_>>()?,
            ),
            Json::Object(map) => {
                if let Some(tag) = map.get(OID_TAG) {
                    return parse_tag(map.len(), tag.as_str());
                }
                let mut doc = Document::new();
                for (key, value) in map {
                    doc.insert(key.clone(), self.decode_at(value, depth + 1)?);
                }
                Value::Document(doc)
            }
        })
    }

    fn decode_string(&self, s: &str) -> Value {
        if self.config.legacy_hex_strings && ObjectId::looks_like_hex(s) {
            if let Ok(id) = ObjectId::from_hex(s) {
                return Value::ObjectId(id);
            }
        }
        Value::String(s.to_string())
    }

    fn revive_at(&self, value: Value, depth: usize) -> Result<Value> {
        self.check_depth(depth)?;
        Ok(match value {
            Value::String(s) => self.decode_string(&s),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.revive_at(item, depth + 1))
                    .collect::<Result<_>>()?,
            ),
            Value::Document(doc) => {
                if let Some(tag) = doc.get(OID_TAG) {
                    return parse_tag(doc.len(), tag.as_str());
                }
                let mut out = Document::new();
                for (key, value) in doc {
                    out.insert(key, self.revive_at(value, depth + 1)?);
                }
                Value::Document(out)
            }
            other => other,
        })
    }
}

fn tagged(id: &ObjectId) -> Json {
    let mut map = Map::with_capacity(1);
    map.insert(OID_TAG.to_string(), Json::String(id.to_hex()));
    Json::Object(map)
}

fn parse_tag(map_len: usize, hex: Option<&str>) -> Result<Value> {
    match hex {
        Some(hex) if map_len == 1 => ObjectId::from_hex(hex)
            .map(Value::ObjectId)
            .map_err(|_| CoreError::MalformedPayload(format!("bad {OID_TAG} value {hex:?}"))),
        Some(_) => Err(CoreError::MalformedPayload(format!(
            "{OID_TAG} must be the only key of its map"
        ))),
        None => Err(CoreError::MalformedPayload(format!(
            "{OID_TAG} must be a string"
        ))),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Int(_) | Value::Float(_) => "number",
        Value::String(_) => "string",
        Value::ObjectId(_) => "object id",
        Value::Array(_) => "array",
        Value::Document(_) => "document",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HEX: &str = "507f191e810c19729de860ea";

    fn oid() -> ObjectId {
        ObjectId::from_hex(HEX).unwrap()
    }

    #[test]
    fn test_encode_emits_tagged_form() {
        let codec = IdentifierCodec::default();
        let mut doc = Document::new();
        doc.insert("_id".into(), oid().into());
        doc.insert("tags".into(), Value::Array(vec![oid().into(), "x".into()]));

        let json = codec.encode_document(&doc).unwrap();
        assert_eq!(
            json,
            json!({"_id": {"$oid": HEX}, "tags": [{"$oid": HEX}, "x"]})
        );
    }

    #[test]
    fn test_all_three_forms_decode_to_same_id() {
        let legacy = IdentifierCodec::legacy();

        let tagged = legacy.decode(&json!({"$oid": HEX})).unwrap();
        let bare = legacy.decode(&json!(HEX)).unwrap();
        let native = legacy.revive(Value::ObjectId(oid())).unwrap();

        assert_eq!(tagged, Value::ObjectId(oid()));
        assert_eq!(bare, Value::ObjectId(oid()));
        assert_eq!(native, Value::ObjectId(oid()));
    }

    #[test]
    fn test_bare_hex_stays_string_by_default() {
        let codec = IdentifierCodec::default();
        assert_eq!(codec.decode(&json!(HEX)).unwrap(), Value::String(HEX.into()));
        assert_eq!(
            codec.decode(&json!(HEX.to_uppercase())).unwrap(),
            Value::String(HEX.to_uppercase())
        );
    }

    #[test]
    fn test_legacy_decoding_is_case_insensitive() {
        let codec = IdentifierCodec::legacy();
        assert_eq!(
            codec.decode(&json!(HEX.to_uppercase())).unwrap(),
            Value::ObjectId(oid())
        );
    }

    #[test]
    fn test_nested_decode() {
        let codec = IdentifierCodec::default();
        let doc = codec
            .decode_document(&json!({
                "name": "x",
                "owner": {"ref": {"$oid": HEX}},
                "count": 3,
                "ratio": 0.5,
                "list": [1, null, true]
            }))
            .unwrap();

        let owner = doc["owner"].as_document().unwrap();
        assert_eq!(owner["ref"], Value::ObjectId(oid()));
        assert_eq!(doc["count"], Value::Int(3));
        assert_eq!(doc["ratio"], Value::Float(0.5));
        assert_eq!(
            doc["list"],
            Value::Array(vec![Value::Int(1), Value::Null, Value::Bool(true)])
        );
    }

    #[test]
    fn test_malformed_tag_is_rejected() {
        let codec = IdentifierCodec::default();
        assert!(matches!(
            codec.decode(&json!({"$oid": "nope"})),
            Err(CoreError::MalformedPayload(_))
        ));
        assert!(matches!(
            codec.decode(&json!({"$oid": 12})),
            Err(CoreError::MalformedPayload(_))
        ));
        assert!(matches!(
            codec.decode(&json!({"$oid": HEX, "extra": 1})),
            Err(CoreError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_decode_document_requires_object() {
        let codec = IdentifierCodec::default();
        assert!(matches!(
            codec.decode_document(&json!([1, 2])),
            Err(CoreError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_depth_limit() {
        let codec = IdentifierCodec::new(CodecConfig {
            max_depth: 4,
            ..CodecConfig::default()
        });

        let mut json = json!("leaf");
        for _ in 0..10 {
            json = json!([json]);
        }
        assert!(matches!(
            codec.decode(&json),
            Err(CoreError::MalformedPayload(_))
        ));

        let mut value = Value::Null;
        for _ in 0..10 {
            value = Value::Array(vec![value]);
        }
        assert!(codec.encode(&value).is_err());
        assert!(codec.revive(value).is_err());
    }

    #[test]
    fn test_revive_tagged_subdocument() {
        let codec = IdentifierCodec::default();
        let mut tag = Document::new();
        tag.insert(OID_TAG.into(), HEX.into());
        let mut doc = Document::new();
        doc.insert("ref".into(), Value::Document(tag));

        let revived = codec.revive(Value::Document(doc)).unwrap();
        assert_eq!(
            revived.as_document().unwrap()["ref"],
            Value::ObjectId(oid())
        );
    }

    #[test]
    fn test_non_finite_floats_are_rejected() {
        let codec = IdentifierCodec::default();
        for f in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = codec.encode(&Value::Float(f)).unwrap_err();
            assert!(matches!(err, CoreError::MalformedPayload(_)));
        }

        let mut doc = Document::new();
        doc.insert("ratio".into(), Value::Array(vec![Value::Float(f64::NAN)]));
        assert!(codec.encode_document(&doc).is_err());
        assert_eq!(codec.encode(&Value::Float(1.5)).unwrap(), json!(1.5));
    }

    #[test]
    fn test_native_oid_key_is_rejected() {
        let codec = IdentifierCodec::default();

        let mut lookalike = Document::new();
        lookalike.insert(OID_TAG.into(), Value::String(oid().to_hex()));
        let mut doc = Document::new();
        doc.insert("ref".into(), Value::Document(lookalike.clone()));

        let err = codec.encode_document(&doc).unwrap_err();
        assert!(matches!(err, CoreError::MalformedPayload(_)));
        assert!(codec.encode_document(&lookalike).is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn identifier_round_trips(bytes in any::<[u8; 12]>()) {
                let id = ObjectId::from_bytes(bytes);
                for codec in [IdentifierCodec::default(), IdentifierCodec::legacy()] {
                    let wire = codec.encode(&Value::ObjectId(id)).unwrap();
                    prop_assert_eq!(codec.decode(&wire).unwrap(), Value::ObjectId(id));
                }
            }

            #[test]
            fn hex_forms_agree(bytes in any::<[u8; 12]>()) {
                let id = ObjectId::from_bytes(bytes);
                let codec = IdentifierCodec::legacy();
                let tagged = codec.decode(&json!({"$oid": id.to_hex()})).unwrap();
                let bare = codec.decode(&json!(id.to_hex())).unwrap();
                prop_assert_eq!(&tagged, &bare);
                prop_assert_eq!(codec.revive(Value::ObjectId(id)).unwrap(), tagged);
            }
        }
    }
}

//! Value marshaling.
//!
//! An [`RpcValue`] is split into a JSON tree (`objects`) in which every
//! binary leaf is replaced by a placeholder, and an ordered list of raw
//! chunks. Binary leaves are collected depth-first, left to right, so the
//! placeholder index alone locates each chunk on the way back.
//!
//! ```text
//! {"name": "mesh", "data": <bytes>}  =>  objects: {"data": {"$binary": 0}, "name": "mesh"}
//!                                        chunks:  [<bytes>]
//! ```
//!
//! A user object whose only key is `$binary` or `$escape` is wrapped in
//! `{"$escape": {...}}` so it can never be read back as a placeholder.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

use crate::error::{ConduitError, Result};

const BINARY_KEY: &str = "$binary";
const ESCAPE_KEY: &str = "$escape";

/// A call parameter or result: JSON-like data with binary leaves.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RpcValue {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<RpcValue>),
    Object(BTreeMap<String, RpcValue>),
    Binary(Bytes),
}

/// Canonical marshaled form of an [`RpcValue`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SerializedValue {
    pub objects: Value,
    #[serde(with = "base64_chunks", default)]
    pub chunks: Vec<Bytes>,
}

impl SerializedValue {
    /// Total bytes held in binary chunks.
    pub fn binary_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }
}

/// Marshal a value. Pure; never fails.
pub fn serialize(value: &RpcValue) -> SerializedValue {
    let mut chunks = Vec::new();
    let objects = extract(value, &mut chunks);
    SerializedValue { objects, chunks }
}

/// Rebuild a value from its marshaled form.
///
/// Fails with [`ConduitError::MalformedValue`] when a placeholder points
/// outside the chunk list, when a chunk is referenced twice, or when a chunk
/// is never referenced.
pub fn deserialize(serialized: SerializedValue) -> Result<RpcValue> {
    let SerializedValue { objects, chunks } = serialized;
    let total = chunks.len();
    let mut slots: Vec<Option<Bytes>> = chunks.into_iter().map(Some).collect();
    let value = restore(objects, &mut slots)?;

    let unused = slots.iter().filter(|slot| slot.is_some()).count();
    if unused > 0 {
        return Err(ConduitError::malformed(format!(
            "{} of {} chunks are not referenced by any placeholder",
            unused, total
        )));
    }
    Ok(value)
}

fn extract(value: &RpcValue, chunks: &mut Vec<Bytes>) -> Value {
    match value {
        RpcValue::Null => Value::Null,
        RpcValue::Bool(b) => Value::Bool(*b),
        RpcValue::Number(n) => Value::Number(n.clone()),
        RpcValue::String(s) => Value::String(s.clone()),
        RpcValue::Array(items) => {
            Value::Array(items.iter().map(|item| extract(item, chunks)).collect())
        }
        RpcValue::Object(fields) => {
            let map: Map<String, Value> = fields
                .iter()
                .map(|(key, field)| (key.clone(), extract(field, chunks)))
                .collect();
            if needs_escape(&map) {
                let mut wrapper = Map::new();
                wrapper.insert(ESCAPE_KEY.to_string(), Value::Object(map));
                Value::Object(wrapper)
            } else {
                Value::Object(map)
            }
        }
        RpcValue::Binary(bytes) => {
            let index = chunks.len();
            chunks.push(bytes.clone());
            let mut placeholder = Map::new();
            placeholder.insert(BINARY_KEY.to_string(), Value::from(index));
            Value::Object(placeholder)
        }
    }
}

fn needs_escape(map: &Map<String, Value>) -> bool {
    map.len() == 1 && (map.contains_key(BINARY_KEY) || map.contains_key(ESCAPE_KEY))
}

fn restore(objects: Value, slots: &mut [Option<Bytes>]) -> Result<RpcValue> {
    Ok(match objects {
        Value::Null => RpcValue::Null,
        Value::Bool(b) => RpcValue::Bool(b),
        Value::Number(n) => RpcValue::Number(n),
        Value::String(s) => RpcValue::String(s),
        Value::Array(items) => RpcValue::Array(
            items
                .into_iter()
                .map(|item| restore(item, slots))
                .collect::<Result<_>>()?,
        ),
        Value::Object(mut map) => {
            if map.len() == 1 {
                if let Some(index) = map.get(BINARY_KEY) {
                    return take_chunk(index, slots);
                }
                if let Some(Value::Object(_)) = map.get(ESCAPE_KEY) {
                    if let Some(Value::Object(inner)) = map.remove(ESCAPE_KEY) {
                        return restore_fields(inner, slots);
                    }
                }
            }
            restore_fields(map, slots)?
        }
    })
}

fn restore_fields(map: Map<String, Value>, slots: &mut [Option<Bytes>]) -> Result<RpcValue> {
    let mut fields = BTreeMap::new();
    for (key, field) in map {
        fields.insert(key, restore(field, slots)?);
    }
    Ok(RpcValue::Object(fields))
}

fn take_chunk(index: &Value, slots: &mut [Option<Bytes>]) -> Result<RpcValue> {
    let index = index
        .as_u64()
        .ok_or_else(|| ConduitError::malformed(format!("placeholder index {} is not an integer", index)))?;
    let len = slots.len();
    let slot = usize::try_from(index)
        .ok()
        .and_then(|i| slots.get_mut(i))
        .ok_or_else(|| {
            ConduitError::malformed(format!(
                "placeholder {} outside chunk range [0, {})",
                index, len
            ))
        })?;
    slot.take()
        .map(RpcValue::Binary)
        .ok_or_else(|| ConduitError::malformed(format!("chunk {} referenced twice", index)))
}

impl RpcValue {
    /// Build an object from key/value pairs.
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, RpcValue)>,
    {
        RpcValue::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Convert from plain JSON (which never contains binary leaves).
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => RpcValue::Null,
            Value::Bool(b) => RpcValue::Bool(b),
            Value::Number(n) => RpcValue::Number(n),
            Value::String(s) => RpcValue::String(s),
            Value::Array(items) => {
                RpcValue::Array(items.into_iter().map(RpcValue::from_json).collect())
            }
            Value::Object(map) => RpcValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, RpcValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert any serde-serializable value.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::from_json(serde_json::to_value(value)?))
    }

    /// Convert to plain JSON. Binary leaves become arrays of byte values.
    pub fn to_json(&self) -> Value {
        match self {
            RpcValue::Null => Value::Null,
            RpcValue::Bool(b) => Value::Bool(*b),
            RpcValue::Number(n) => Value::Number(n.clone()),
            RpcValue::String(s) => Value::String(s.clone()),
            RpcValue::Array(items) => Value::Array(items.iter().map(RpcValue::to_json).collect()),
            RpcValue::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            RpcValue::Binary(bytes) => {
                Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
            }
        }
    }

    /// Decode into a serde type through the JSON view.
    pub fn deserialize_into<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json())?)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RpcValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RpcValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            RpcValue::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RpcValue]> {
        match self {
            RpcValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&RpcValue> {
        match self {
            RpcValue::Object(fields) => fields.get(key),
            _ => None,
        }
    }
}

impl From<bool> for RpcValue {
    fn from(value: bool) -> Self {
        RpcValue::Bool(value)
    }
}

impl From<i64> for RpcValue {
    fn from(value: i64) -> Self {
        RpcValue::Number(value.into())
    }
}

impl From<i32> for RpcValue {
    fn from(value: i32) -> Self {
        RpcValue::Number(value.into())
    }
}

impl From<u64> for RpcValue {
    fn from(value: u64) -> Self {
        RpcValue::Number(value.into())
    }
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        RpcValue::String(value.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(value: String) -> Self {
        RpcValue::String(value)
    }
}

impl From<Bytes> for RpcValue {
    fn from(value: Bytes) -> Self {
        RpcValue::Binary(value)
    }
}

impl From<Vec<u8>> for RpcValue {
    fn from(value: Vec<u8>) -> Self {
        RpcValue::Binary(Bytes::from(value))
    }
}

impl From<Vec<RpcValue>> for RpcValue {
    fn from(value: Vec<RpcValue>) -> Self {
        RpcValue::Array(value)
    }
}

/// Base64 representation of chunk lists for JSON transports.
mod base64_chunks {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(chunks: &[Bytes], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<String> = chunks.iter().map(|c| STANDARD.encode(c)).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Bytes>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|s| {
                STANDARD
                    .decode(s.as_bytes())
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nested_value() -> RpcValue {
        RpcValue::object([
            ("name", RpcValue::from("mesh")),
            ("header", RpcValue::from(vec![1u8, 2, 3])),
            (
                "parts",
                RpcValue::Array(vec![
                    RpcValue::from(vec![4u8; 16]),
                    RpcValue::object([
                        ("inner", RpcValue::from(Vec::<u8>::new())),
                        ("count", RpcValue::from(7i64)),
                    ]),
                    RpcValue::Null,
                ]),
            ),
        ])
    }

    #[test]
    fn test_roundtrip_nested_binary() {
        let value = nested_value();
        let serialized = serialize(&value);
        assert_eq!(serialized.chunks.len(), 3);
        assert_eq!(deserialize(serialized).unwrap(), value);
    }

    #[test]
    fn test_roundtrip_without_binary() {
        let value = RpcValue::from_json(json!({"a": [1, 2.5, "x"], "b": {"c": null}}));
        let serialized = serialize(&value);
        assert!(serialized.chunks.is_empty());
        assert_eq!(serialized.objects, json!({"a": [1, 2.5, "x"], "b": {"c": null}}));
        assert_eq!(deserialize(serialized).unwrap(), value);
    }

    #[test]
    fn test_chunks_follow_depth_first_order() {
        // Object keys iterate in sorted order: "header" < "parts".
        let serialized = serialize(&nested_value());
        assert_eq!(serialized.chunks[0].as_ref(), &[1, 2, 3]);
        assert_eq!(serialized.chunks[1].len(), 16);
        assert!(serialized.chunks[2].is_empty());
        assert_eq!(serialized.objects["header"], json!({"$binary": 0}));
        assert_eq!(serialized.objects["parts"][1]["inner"], json!({"$binary": 2}));
    }

    #[test]
    fn test_top_level_binary() {
        let value = RpcValue::from(vec![9u8; 32]);
        let serialized = serialize(&value);
        assert_eq!(serialized.objects, json!({"$binary": 0}));
        assert_eq!(deserialize(serialized).unwrap(), value);
    }

    #[test]
    fn test_placeholder_lookalike_is_escaped() {
        let value = RpcValue::from_json(json!({"$binary": 0}));
        let serialized = serialize(&value);
        assert!(serialized.chunks.is_empty());
        assert_eq!(serialized.objects, json!({"$escape": {"$binary": 0}}));
        assert_eq!(deserialize(serialized).unwrap(), value);

        let value = RpcValue::from_json(json!({"$escape": {"k": 1}}));
        assert_eq!(deserialize(serialize(&value)).unwrap(), value);
    }

    #[test]
    fn test_out_of_range_placeholder_is_malformed() {
        let serialized = SerializedValue {
            objects: json!([{"$binary": 1}]),
            chunks: vec![Bytes::from_static(b"a")],
        };
        let err = deserialize(serialized).unwrap_err();
        assert!(matches!(err, ConduitError::MalformedValue { .. }));
    }

    #[test]
    fn test_double_reference_is_malformed() {
        let serialized = SerializedValue {
            objects: json!([{"$binary": 0}, {"$binary": 0}]),
            chunks: vec![Bytes::from_static(b"a")],
        };
        assert!(matches!(
            deserialize(serialized),
            Err(ConduitError::MalformedValue { .. })
        ));
    }

    #[test]
    fn test_unreferenced_chunk_is_malformed() {
        let serialized = SerializedValue {
            objects: json!(null),
            chunks: vec![Bytes::from_static(b"a")],
        };
        assert!(matches!(
            deserialize(serialized),
            Err(ConduitError::MalformedValue { .. })
        ));
    }

    #[test]
    fn test_negative_placeholder_is_malformed() {
        let serialized = SerializedValue {
            objects: json!({"$binary": -1}),
            chunks: vec![],
        };
        assert!(matches!(
            deserialize(serialized),
            Err(ConduitError::MalformedValue { .. })
        ));
    }

    #[test]
    fn test_serialized_value_json_uses_base64() {
        let serialized = serialize(&RpcValue::from(vec![0u8, 255]));
        let json = serde_json::to_value(&serialized).unwrap();
        assert_eq!(json["chunks"], json!(["AP8="]));

        let back: SerializedValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, serialized);
    }

    #[test]
    fn test_deserialize_into_typed() {
        let value = RpcValue::from_json(json!([2, 3]));
        let pair: (i64, i64) = value.deserialize_into().unwrap();
        assert_eq!(pair, (2, 3));
    }
}

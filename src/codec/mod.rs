//! Serialization guard: converts worker values to and from their stored
//! byte form.
//!
//! Stored layout: `b"SPV"`, format version byte, type tag byte, then the
//! JSON body of the [`Value`]. Decoding validates the header against an
//! allow-list of tags before the body is parsed, and the body can only ever
//! materialize as plain data.

pub mod value;

pub use value::Value;

use thiserror::Error;

const MAGIC: &[u8; 3] = b"SPV";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 5;
const MAX_DEPTH: usize = 32;

/// Python types that wrap handles, callables or native resources.
const DENIED_TYPES: &[&str] = &[
    "function",
    "builtin_function_or_method",
    "method",
    "generator",
    "coroutine",
    "async_generator",
    "frame",
    "code",
    "traceback",
    "module",
    "TextIOWrapper",
    "BufferedReader",
    "BufferedWriter",
    "BufferedRandom",
    "FileIO",
    "BytesIO",
    "StringIO",
    "socket",
    "SSLSocket",
    "Thread",
    "lock",
    "RLock",
    "Popen",
];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GuardError {
    #[error("value of type `{type_name}` cannot be persisted: {reason}")]
    Unserializable { type_name: String, reason: String },
    #[error("serialized value is {size} bytes, over the {cap} byte variable cap")]
    TooLarge { size: usize, cap: usize },
    #[error("stored value rejected: {0}")]
    Corrupt(String),
}

/// A value in its stored form.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub type_tag: String,
}

impl Encoded {
    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug, Clone)]
pub struct SerializationGuard {
    variable_byte_cap: usize,
}

impl SerializationGuard {
    pub fn new(variable_byte_cap: usize) -> Self {
        Self { variable_byte_cap }
    }

    pub fn variable_byte_cap(&self) -> usize {
        self.variable_byte_cap
    }

    pub fn serialize(&self, value: &Value) -> Result<Encoded, GuardError> {
        if let Value::TooLarge { size, .. } = value {
            return Err(GuardError::TooLarge {
                size: usize::try_from(*size).unwrap_or(usize::MAX),
                cap: self.variable_byte_cap,
            });
        }
        check_storable(value, 0)?;
        let tag = tag_byte(value).ok_or_else(|| unserializable(value))?;

        let body = serde_json::to_vec(value).map_err(|e| GuardError::Unserializable {
            type_name: value.type_tag().to_string(),
            reason: e.to_string(),
        })?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(MAGIC);
        bytes.push(FORMAT_VERSION);
        bytes.push(tag);
        bytes.extend_from_slice(&body);

        if bytes.len() > self.variable_byte_cap {
            return Err(GuardError::TooLarge {
                size: bytes.len(),
                cap: self.variable_byte_cap,
            });
        }

        Ok(Encoded {
            bytes,
            type_tag: value.type_tag().to_string(),
        })
    }

    pub fn deserialize(&self, bytes: &[u8]) -> Result<Value, GuardError> {
        if bytes.len() < HEADER_LEN {
            return Err(GuardError::Corrupt(format!(
                "{} bytes is shorter than the header",
                bytes.len()
            )));
        }
        if &bytes[..3] != MAGIC {
            return Err(GuardError::Corrupt("bad magic".to_string()));
        }
        if bytes[3] != FORMAT_VERSION {
            return Err(GuardError::Corrupt(format!(
                "unsupported format version {}",
                bytes[3]
            )));
        }
        let header_tag = bytes[4];
        if tag_name(header_tag).is_none() {
            return Err(GuardError::Corrupt(format!(
                "tag 0x{:02x} is not allowed",
                header_tag
            )));
        }

        let value: Value = serde_json::from_slice(&bytes[HEADER_LEN..])
            .map_err(|e| GuardError::Corrupt(format!("malformed body: {}", e)))?;

        if tag_byte(&value) != Some(header_tag) {
            return Err(GuardError::Corrupt(format!(
                "header declares {} but body holds {}",
                tag_name(header_tag).unwrap_or("?"),
                value.type_tag()
            )));
        }
        check_storable(&value, 0).map_err(|e| GuardError::Corrupt(e.to_string()))?;
        Ok(value)
    }
}

/// Whether a type name is on the handle/callable deny-list.
pub fn is_denied_type(type_name: &str) -> bool {
    DENIED_TYPES.contains(&type_name)
}

fn unserializable(value: &Value) -> GuardError {
    let type_name = value.type_tag().to_string();
    let reason = if is_denied_type(&type_name) {
        "handles, callables and native resources are never persisted".to_string()
    } else {
        "not structurally serializable".to_string()
    };
    GuardError::Unserializable { type_name, reason }
}

fn malformed(value: &Value, reason: String) -> GuardError {
    GuardError::Unserializable {
        type_name: value.type_tag().to_string(),
        reason,
    }
}

/// Element types an array may declare.
fn is_array_dtype(dtype: &str) -> bool {
    matches!(dtype, "bool" | "str") || sized_dtype(dtype, &["int", "uint", "float"])
}

/// Column types a Series or DataFrame may declare.
fn is_column_dtype(dtype: &str) -> bool {
    is_array_dtype(dtype)
        || matches!(dtype, "object" | "string" | "category" | "boolean")
        || sized_dtype(dtype, &["Int", "UInt", "Float"])
}

fn sized_dtype(dtype: &str, families: &[&str]) -> bool {
    families.iter().any(|family| {
        dtype
            .strip_prefix(family)
            .is_some_and(|bits| matches!(bits, "8" | "16" | "32" | "64"))
    })
}

/// Index and column labels: scalars, or tuples of scalars for multi-level
/// labels.
fn is_label(value: &Value) -> bool {
    match value {
        Value::Tuple(items) => items.iter().all(Value::is_scalar),
        other => other.is_scalar(),
    }
}

fn check_labels(value: &Value, what: &str, labels: &[Value]) -> Result<(), GuardError> {
    match labels.iter().find(|l| !is_label(l)) {
        Some(bad) => Err(malformed(
            value,
            format!("{} label of type `{}` is not plain data", what, bad.type_tag()),
        )),
        None => Ok(()),
    }
}

fn check_cells<'a>(value: &Value, mut cells: impl Iterator<Item = &'a Value>) -> Result<(), GuardError> {
    match cells.find(|c| !c.is_scalar()) {
        Some(bad) => Err(malformed(
            value,
            format!("element of type `{}` is not plain data", bad.type_tag()),
        )),
        None => Ok(()),
    }
}

/// Shape, dtype and element checks for the numpy and pandas forms.
fn check_tabular(value: &Value) -> Result<(), GuardError> {
    match value {
        Value::NdArray { dtype, shape, data } => {
            if !is_array_dtype(dtype) {
                return Err(malformed(value, format!("dtype '{}' is not allowed", dtype)));
            }
            if shape.len() > MAX_DEPTH {
                return Err(malformed(value, format!("{} dimensions is too many", shape.len())));
            }
            let expected = shape.iter().try_fold(1u64, |acc, d| acc.checked_mul(*d));
            if expected != Some(data.len() as u64) {
                return Err(malformed(
                    value,
                    format!("shape {:?} does not hold {} elements", shape, data.len()),
                ));
            }
            check_cells(value, data.iter())
        }
        Value::Series {
            name,
            dtype,
            index,
            data,
        } => {
            if !is_column_dtype(dtype) {
                return Err(malformed(value, format!("dtype '{}' is not allowed", dtype)));
            }
            if index.len() != data.len() {
                return Err(malformed(
                    value,
                    format!("{} labels for {} values", index.len(), data.len()),
                ));
            }
            check_labels(value, "name", std::slice::from_ref(&**name))?;
            check_labels(value, "index", index)?;
            check_cells(value, data.iter())
        }
        Value::DataFrame {
            columns,
            dtypes,
            index,
            data,
        } => {
            if let Some(bad) = dtypes.iter().find(|d| !is_column_dtype(d)) {
                return Err(malformed(value, format!("dtype '{}' is not allowed", bad)));
            }
            if dtypes.len() != columns.len() || data.len() != index.len() {
                return Err(malformed(value, "labels do not match the data".to_string()));
            }
            if let Some(row) = data.iter().find(|row| row.len() != columns.len()) {
                return Err(malformed(
                    value,
                    format!("row of {} cells under {} columns", row.len(), columns.len()),
                ));
            }
            check_labels(value, "column", columns)?;
            check_labels(value, "index", index)?;
            check_cells(value, data.iter().flatten())
        }
        _ => Ok(()),
    }
}

fn check_storable(value: &Value, depth: usize) -> Result<(), GuardError> {
    if depth > MAX_DEPTH {
        return Err(GuardError::Unserializable {
            type_name: value.type_tag().to_string(),
            reason: format!("nesting deeper than {} levels", MAX_DEPTH),
        });
    }
    match value {
        Value::Opaque(_) => return Err(unserializable(value)),
        Value::TooLarge { .. } => {
            return Err(malformed(value, "size markers cannot be stored".to_string()))
        }
        Value::NdArray { .. } | Value::Series { .. } | Value::DataFrame { .. } => {
            // cells are scalars, so there is nothing deeper to walk
            return check_tabular(value);
        }
        Value::BigInt(digits) => {
            let unsigned = digits.strip_prefix('-').unwrap_or(digits);
            if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
                return Err(GuardError::Unserializable {
                    type_name: "int".to_string(),
                    reason: format!("'{}' is not a decimal integer", digits),
                });
            }
        }
        Value::Set(items) | Value::FrozenSet(items) => {
            if let Some(bad) = items.iter().find(|v| !v.is_hashable()) {
                return Err(GuardError::Unserializable {
                    type_name: value.type_tag().to_string(),
                    reason: format!("member of type `{}` is unhashable", bad.type_tag()),
                });
            }
        }
        Value::Dict(entries) => {
            if let Some((bad, _)) = entries.iter().find(|(k, _)| !k.is_hashable()) {
                return Err(GuardError::Unserializable {
                    type_name: "dict".to_string(),
                    reason: format!("key of type `{}` is unhashable", bad.type_tag()),
                });
            }
        }
        _ => {}
    }
    for child in value.children() {
        check_storable(child, depth + 1)?;
    }
    Ok(())
}

fn tag_byte(value: &Value) -> Option<u8> {
    let tag = match value {
        Value::None => 0x00,
        Value::Bool(_) => 0x01,
        Value::Int(_) => 0x02,
        Value::BigInt(_) => 0x03,
        Value::Float(_) => 0x04,
        Value::Str(_) => 0x05,
        Value::Bytes(_) => 0x06,
        Value::List(_) => 0x07,
        Value::Tuple(_) => 0x08,
        Value::Set(_) => 0x09,
        Value::FrozenSet(_) => 0x0A,
        Value::Dict(_) => 0x0B,
        Value::NdArray { .. } => 0x0C,
        Value::Series { .. } => 0x0D,
        Value::DataFrame { .. } => 0x0E,
        Value::TooLarge { .. } | Value::Opaque(_) => return None,
    };
    Some(tag)
}

fn tag_name(tag: u8) -> Option<&'static str> {
    let name = match tag {
        0x00 => "none",
        0x01 => "bool",
        0x02 => "int",
        0x03 => "big_int",
        0x04 => "float",
        0x05 => "str",
        0x06 => "bytes",
        0x07 => "list",
        0x08 => "tuple",
        0x09 => "set",
        0x0A => "frozen_set",
        0x0B => "dict",
        0x0C => "nd_array",
        0x0D => "series",
        0x0E => "data_frame",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> SerializationGuard {
        SerializationGuard::new(1024)
    }

    #[test]
    fn test_roundtrip_nested_value() {
        let value = Value::Dict(vec![
            (Value::Str("name".into()), Value::Str("Alice".into())),
            (
                Value::Tuple(vec![Value::Int(1), Value::Int(2)]),
                Value::List(vec![Value::Float(0.5), Value::None, Value::Bytes(vec![7, 8])]),
            ),
        ]);
        let g = guard();
        let encoded = g.serialize(&value).unwrap();
        assert_eq!(encoded.type_tag, "dict");
        assert_eq!(&encoded.bytes[..3], b"SPV");
        assert_eq!(g.deserialize(&encoded.bytes).unwrap(), value);
    }

    #[test]
    fn test_denied_type_is_unserializable() {
        let err = guard()
            .serialize(&Value::Opaque("function".into()))
            .unwrap_err();
        match err {
            GuardError::Unserializable { type_name, reason } => {
                assert_eq!(type_name, "function");
                assert!(reason.contains("callables"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_opaque_is_unserializable() {
        let err = guard()
            .serialize(&Value::Opaque("DataFrame".into()))
            .unwrap_err();
        assert!(matches!(
            err,
            GuardError::Unserializable { ref reason, .. } if reason.contains("structurally")
        ));
    }

    #[test]
    fn test_nested_opaque_is_unserializable() {
        let value = Value::List(vec![Value::Int(1), Value::Opaque("socket".into())]);
        assert!(matches!(
            guard().serialize(&value),
            Err(GuardError::Unserializable { .. })
        ));
    }

    #[test]
    fn test_too_large() {
        let value = Value::Str("x".repeat(2048));
        match guard().serialize(&value) {
            Err(GuardError::TooLarge { size, cap }) => {
                assert!(size > 2048);
                assert_eq!(cap, 1024);
            }
            other => panic!("expected TooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_deserialize_rejects_short_and_bad_magic() {
        let g = guard();
        assert!(matches!(g.deserialize(b"SP"), Err(GuardError::Corrupt(_))));
        assert!(matches!(
            g.deserialize(b"XYZ\x01\x02{\"t\":\"int\",\"v\":1}"),
            Err(GuardError::Corrupt(_))
        ));
    }

    #[test]
    fn test_deserialize_rejects_unknown_version_and_tag() {
        let g = guard();
        assert!(g.deserialize(b"SPV\x02\x02{\"t\":\"int\",\"v\":1}").is_err());
        assert!(g.deserialize(b"SPV\x01\x7f{\"t\":\"int\",\"v\":1}").is_err());
    }

    #[test]
    fn test_deserialize_rejects_header_body_mismatch() {
        let err = guard()
            .deserialize(b"SPV\x01\x05{\"t\":\"int\",\"v\":1}")
            .unwrap_err();
        assert!(err.to_string().contains("header declares str"));
    }

    #[test]
    fn test_deserialize_rejects_opaque_body() {
        // An opaque value has no tag byte of its own, so smuggle it inside a list.
        let bytes = b"SPV\x01\x07{\"t\":\"list\",\"v\":[{\"t\":\"opaque\",\"v\":\"function\"}]}";
        assert!(matches!(
            guard().deserialize(bytes),
            Err(GuardError::Corrupt(_))
        ));
    }

    #[test]
    fn test_deserialize_rejects_unhashable_key() {
        let bytes =
            b"SPV\x01\x0b{\"t\":\"dict\",\"v\":[[{\"t\":\"list\",\"v\":[]},{\"t\":\"none\"}]]}";
        assert!(guard().deserialize(bytes).is_err());
    }

    #[test]
    fn test_bigint_validation() {
        let g = guard();
        assert!(g.serialize(&Value::BigInt("-123456789012345678901234567890".into())).is_ok());
        assert!(g.serialize(&Value::BigInt("12a".into())).is_err());
        assert!(g.serialize(&Value::BigInt("-".into())).is_err());
    }

    #[test]
    fn test_excessive_nesting_rejected() {
        let mut value = Value::Int(0);
        for _ in 0..(MAX_DEPTH + 2) {
            value = Value::List(vec![value]);
        }
        let g = SerializationGuard::new(1 << 20);
        assert!(matches!(
            g.serialize(&value),
            Err(GuardError::Unserializable { .. })
        ));
    }

    fn frame(dtypes: &[&str], data: Vec<Vec<Value>>) -> Value {
        Value::DataFrame {
            columns: vec![Value::Str("a".into()), Value::Str("b".into())],
            dtypes: dtypes.iter().map(|d| d.to_string()).collect(),
            index: (0..data.len() as i64).map(Value::Int).collect(),
            data,
        }
    }

    #[test]
    fn test_roundtrip_frame_and_array() {
        let g = SerializationGuard::new(1 << 16);
        let df = frame(
            &["int64", "object"],
            vec![
                vec![Value::Int(1), Value::Str("x".into())],
                vec![Value::Int(2), Value::None],
            ],
        );
        let encoded = g.serialize(&df).unwrap();
        assert_eq!(encoded.type_tag, "DataFrame");
        assert_eq!(g.deserialize(&encoded.bytes).unwrap(), df);

        let array = Value::NdArray {
            dtype: "float64".into(),
            shape: vec![2, 2],
            data: [1.0, 2.0, 3.0, 4.0].into_iter().map(Value::Float).collect(),
        };
        let encoded = g.serialize(&array).unwrap();
        assert_eq!(encoded.type_tag, "ndarray");
        assert_eq!(g.deserialize(&encoded.bytes).unwrap(), array);

        let series = Value::Series {
            name: Box::new(Value::Str("score".into())),
            dtype: "Int64".into(),
            index: vec![Value::Tuple(vec![Value::Str("a".into()), Value::Int(1)])],
            data: vec![Value::Int(5)],
        };
        assert!(g.serialize(&series).is_ok());
    }

    #[test]
    fn test_array_shape_and_dtype_checked() {
        let g = guard();
        let bad_shape = Value::NdArray {
            dtype: "int64".into(),
            shape: vec![3],
            data: vec![Value::Int(1)],
        };
        assert!(matches!(g.serialize(&bad_shape), Err(GuardError::Unserializable { .. })));

        let overflowing = Value::NdArray {
            dtype: "int64".into(),
            shape: vec![u64::MAX, 2],
            data: vec![],
        };
        assert!(g.serialize(&overflowing).is_err());

        let bad_dtype = Value::NdArray {
            dtype: "object".into(),
            shape: vec![1],
            data: vec![Value::Int(1)],
        };
        assert!(g.serialize(&bad_dtype).unwrap_err().to_string().contains("object"));

        let nested = Value::NdArray {
            dtype: "int64".into(),
            shape: vec![1],
            data: vec![Value::List(vec![])],
        };
        assert!(g.serialize(&nested).is_err());
    }

    #[test]
    fn test_frame_structure_checked() {
        let g = SerializationGuard::new(1 << 16);
        let ragged = frame(&["int64", "int64"], vec![vec![Value::Int(1)]]);
        assert!(g.serialize(&ragged).is_err());

        let datetime = frame(
            &["datetime64[ns]", "int64"],
            vec![vec![Value::Int(1), Value::Int(2)]],
        );
        assert!(g.serialize(&datetime).is_err());

        let opaque_cell = frame(
            &["object", "int64"],
            vec![vec![Value::Opaque("Timestamp".into()), Value::Int(2)]],
        );
        assert!(g.serialize(&opaque_cell).is_err());
    }

    #[test]
    fn test_deserialize_rejects_tampered_frame() {
        let g = SerializationGuard::new(1 << 16);
        let df = frame(&["int64", "int64"], vec![vec![Value::Int(1), Value::Int(2)]]);
        let mut bytes = g.serialize(&df).unwrap().bytes;
        let body = String::from_utf8(bytes.split_off(HEADER_LEN)).unwrap();
        bytes.extend_from_slice(body.replace("\"int64\"", "\"complex128\"").as_bytes());
        assert!(matches!(g.deserialize(&bytes), Err(GuardError::Corrupt(_))));
    }

    #[test]
    fn test_size_marker_becomes_too_large() {
        let marker = Value::TooLarge {
            type_name: "str".into(),
            size: 140_000_005,
        };
        assert_eq!(
            guard().serialize(&marker).unwrap_err(),
            GuardError::TooLarge {
                size: 140_000_005,
                cap: 1024
            }
        );
        let nested = Value::List(vec![marker]);
        assert!(matches!(
            guard().serialize(&nested),
            Err(GuardError::Unserializable { .. })
        ));
    }

    #[test]
    fn test_denied_type_lookup() {
        assert!(is_denied_type("TextIOWrapper"));
        assert!(!is_denied_type("DataFrame"));
    }
}

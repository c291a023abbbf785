//! Data model for values crossing the worker boundary.
//!
//! A `Value` is pure data: decoding one never runs code. The serde shape is
//! adjacently tagged (`{"t": "int", "v": 3}`) and is shared with the Python
//! worker, which produces and consumes exactly this form.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    /// Integer outside the i64 range, kept as a decimal string.
    BigInt(String),
    Float(#[serde(with = "float_repr")] f64),
    Str(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    /// numpy array: element dtype, shape, and elements in C order.
    NdArray {
        dtype: String,
        shape: Vec<u64>,
        data: Vec<Value>,
    },
    /// pandas Series with its index labels.
    Series {
        name: Box<Value>,
        dtype: String,
        index: Vec<Value>,
        data: Vec<Value>,
    },
    /// pandas DataFrame in split orientation: labels, one dtype per column,
    /// and row-major cells.
    DataFrame {
        columns: Vec<Value>,
        dtypes: Vec<String>,
        index: Vec<Value>,
        data: Vec<Vec<Value>>,
    },
    /// Stand-in the worker sends for a binding it measured as over the
    /// variable cap. Never stored.
    TooLarge { type_name: String, size: u64 },
    /// A live value the worker could not express as data. Only the type name
    /// travels; it can never be stored.
    Opaque(String),
}

impl Value {
    /// Python-facing type name, used in variable descriptors.
    pub fn type_tag(&self) -> &str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::BigInt(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::FrozenSet(_) => "frozenset",
            Value::Dict(_) => "dict",
            Value::NdArray { .. } => "ndarray",
            Value::Series { .. } => "Series",
            Value::DataFrame { .. } => "DataFrame",
            Value::TooLarge { type_name, .. } | Value::Opaque(type_name) => type_name,
        }
    }

    /// Whether Python could use this value as a dict key or set member.
    pub fn is_hashable(&self) -> bool {
        match self {
            Value::None
            | Value::Bool(_)
            | Value::Int(_)
            | Value::BigInt(_)
            | Value::Float(_)
            | Value::Str(_)
            | Value::Bytes(_)
            | Value::FrozenSet(_) => true,
            Value::Tuple(items) => items.iter().all(Value::is_hashable),
            _ => false,
        }
    }

    /// Plain data that can sit in an array cell or a frame.
    pub(crate) fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::None
                | Value::Bool(_)
                | Value::Int(_)
                | Value::BigInt(_)
                | Value::Float(_)
                | Value::Str(_)
                | Value::Bytes(_)
        )
    }

    /// Children of a container value, in encounter order.
    pub(crate) fn children(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            Value::List(items) | Value::Tuple(items) | Value::Set(items) | Value::FrozenSet(items) => {
                Box::new(items.iter())
            }
            Value::Dict(entries) => Box::new(entries.iter().flat_map(|(k, v)| [k, v])),
            Value::NdArray { data, .. } => Box::new(data.iter()),
            Value::Series {
                name, index, data, ..
            } => Box::new(std::iter::once(&**name).chain(index).chain(data)),
            Value::DataFrame {
                columns,
                index,
                data,
                ..
            } => Box::new(columns.iter().chain(index).chain(data.iter().flatten())),
            _ => Box::new(std::iter::empty()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Floats travel as their repr so NaN and the infinities survive JSON.
mod float_repr {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:?}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        let repr = String::deserialize(deserializer)?;
        repr.trim()
            .parse::<f64>()
            .map_err(|_| de::Error::custom(format!("invalid float repr '{}'", repr)))
    }
}

pub(crate) mod base64_bytes {
    use base64::Engine;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| de::Error::custom(format!("invalid base64 payload: {}", e)))
    }
}

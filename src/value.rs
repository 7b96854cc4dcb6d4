//! Host-side value model
//!
//! Defines the dynamic [`Value`] type that crosses the map and event-stream
//! boundaries: map keys and values are encoded from it, and decoded samples
//! are delivered back as it.

use std::fmt;

/// A dynamic value marshalled in and out of fixed-size kernel buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Integer, widened so both `i64` and `u64` payloads fit losslessly.
    Int(i128),
    /// Opaque byte string.
    Bytes(Vec<u8>),
    /// Text; NUL-terminated when encoded into a buffer.
    Str(String),
    /// Ordered sequence, produced by array-typed struct fields.
    List(Vec<Value>),
    /// Decoded struct sample with named fields in declaration order.
    Struct(StructValue),
}

impl Value {
    /// Human-readable kind name, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Struct(_) => "struct",
        }
    }

    /// Integer payload, if this is an integer.
    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer payload narrowed to `u64`, if this is a non-negative integer
    /// in range.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Byte payload, if this is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Text payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Struct payload, if this is a decoded struct.
    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }

    /// Build a `serde_json::Value` tree for export.
    ///
    /// Integers that fit `u64`/`i64` become JSON numbers; wider ones fall
    /// back to their decimal string. Byte strings are rendered as lowercase
    /// hex.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(v) => {
                if let Ok(n) = u64::try_from(*v) {
                    serde_json::Value::from(n)
                } else if let Ok(n) = i64::try_from(*v) {
                    serde_json::Value::from(n)
                } else {
                    serde_json::Value::String(v.to_string())
                }
            }
            Value::Bytes(b) => serde_json::Value::String(hex_string(b)),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Struct(s) => {
                let mut map = serde_json::Map::new();
                for (name, value) in s.fields() {
                    map.insert(name.to_string(), value.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Bytes(b) => write!(f, "0x{}", hex_string(b)),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Struct(s) => {
                write!(f, "<{}", s.name())?;
                for (name, value) in s.fields() {
                    write!(f, " {}={}", name, value)?;
                }
                write!(f, ">")
            }
        }
    }
}

macro_rules! impl_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::Int(v as i128)
                }
            }
        )*
    };
}

impl_from_int!(u8, u16, u32, u64, usize, i8, i16, i32, i64);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

/// Named fields of one decoded struct sample, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructValue {
    name: String,
    fields: Vec<(String, Value)>,
}

impl StructValue {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, field: impl Into<String>, value: Value) {
        self.fields.push((field.into(), value));
    }

    /// Struct type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field value by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the struct has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn hex_string(bytes: &[u8]) -> String {
    use fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

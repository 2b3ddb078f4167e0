//! Element datatypes, attribute values and typed chunk buffers.

use core::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Element type of a dataset or chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datatype {
    /// 8-bit unsigned integer
    UInt8,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 32-bit unsigned integer
    UInt32,
    /// 64-bit unsigned integer
    UInt64,
    /// IEEE 754 single precision
    Float32,
    /// IEEE 754 double precision
    Float64,
}

impl Datatype {
    /// Returns the element size in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            Datatype::UInt8 => 1,
            Datatype::Int32 | Datatype::UInt32 | Datatype::Float32 => 4,
            Datatype::Int64 | Datatype::UInt64 | Datatype::Float64 => 8,
        }
    }

    /// Decodes a little-endian buffer of this type into JSON numbers.
    pub fn decode_json(&self, raw: &[u8]) -> Vec<serde_json::Value> {
        let width = self.size_bytes();
        raw.chunks_exact(width)
            .map(|b| match self {
                Datatype::UInt8 => serde_json::Value::from(b[0]),
                Datatype::Int32 => serde_json::Value::from(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                Datatype::UInt32 => serde_json::Value::from(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                Datatype::Float32 => serde_json::Value::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                Datatype::Int64 => serde_json::Value::from(i64::from_le_bytes(le8(b))),
                Datatype::UInt64 => serde_json::Value::from(u64::from_le_bytes(le8(b))),
                Datatype::Float64 => serde_json::Value::from(f64::from_le_bytes(le8(b))),
            })
            .collect()
    }
}

fn le8(b: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&b[..8]);
    out
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Datatype::UInt8 => "uint8",
            Datatype::Int32 => "int32",
            Datatype::Int64 => "int64",
            Datatype::UInt32 => "uint32",
            Datatype::UInt64 => "uint64",
            Datatype::Float32 => "float32",
            Datatype::Float64 => "float64",
        };
        f.write_str(name)
    }
}

/// Rust element types that can be stored as chunk data.
pub trait Element: Copy + Send + Sync + 'static {
    /// Datatype tag for this element.
    const DATATYPE: Datatype;

    /// Appends the little-endian encoding of `self`.
    fn put_le(self, buf: &mut BytesMut);
}

macro_rules! impl_element {
    ($t:ty, $dt:expr, $put:ident) => {
        impl Element for $t {
            const DATATYPE: Datatype = $dt;

            fn put_le(self, buf: &mut BytesMut) {
                buf.$put(self);
            }
        }
    };
}

impl_element!(u8, Datatype::UInt8, put_u8);
impl_element!(i32, Datatype::Int32, put_i32_le);
impl_element!(i64, Datatype::Int64, put_i64_le);
impl_element!(u32, Datatype::UInt32, put_u32_le);
impl_element!(u64, Datatype::UInt64, put_u64_le);
impl_element!(f32, Datatype::Float32, put_f32_le);
impl_element!(f64, Datatype::Float64, put_f64_le);

/// A typed, immutable chunk payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBuffer {
    datatype: Datatype,
    bytes: Bytes,
}

impl ChunkBuffer {
    /// Encodes a slice of elements.
    pub fn from_slice<T: Element>(data: &[T]) -> Self {
        let mut buf = BytesMut::with_capacity(data.len() * T::DATATYPE.size_bytes());
        for v in data {
            v.put_le(&mut buf);
        }
        Self {
            datatype: T::DATATYPE,
            bytes: buf.freeze(),
        }
    }

    /// Wraps an already encoded little-endian buffer.
    pub fn from_raw(datatype: Datatype, bytes: Bytes) -> Self {
        Self { datatype, bytes }
    }

    /// Element datatype.
    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    /// Number of elements.
    pub fn len(&self) -> u64 {
        (self.bytes.len() / self.datatype.size_bytes()) as u64
    }

    /// True for an empty buffer.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Raw little-endian payload.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

impl<T: Element> From<Vec<T>> for ChunkBuffer {
    fn from(v: Vec<T>) -> Self {
        ChunkBuffer::from_slice(&v)
    }
}

/// Declared shape of a record component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    /// Element type
    pub datatype: Datatype,
    /// Global extent, one entry per dimension
    pub extent: Vec<u64>,
}

impl Dataset {
    /// Creates a dataset description.
    pub fn new(datatype: Datatype, extent: Vec<u64>) -> Self {
        Self { datatype, extent }
    }

    /// Total element count.
    pub fn num_elements(&self) -> u64 {
        self.extent.iter().product()
    }
}

/// An attribute value attached to any hierarchy node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Boolean flag
    Bool(bool),
    /// Unsigned integer
    UInt(u64),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Vector of unsigned integers
    UIntVec(Vec<u64>),
    /// Vector of floating point numbers
    FloatVec(Vec<f64>),
    /// Vector of strings
    StrVec(Vec<String>),
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<u64> for AttributeValue {
    fn from(v: u64) -> Self {
        AttributeValue::UInt(v)
    }
}

impl From<u32> for AttributeValue {
    fn from(v: u32) -> Self {
        AttributeValue::UInt(v as u64)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Int(v as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Str(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Str(v)
    }
}

impl From<Vec<u64>> for AttributeValue {
    fn from(v: Vec<u64>) -> Self {
        AttributeValue::UIntVec(v)
    }
}

impl From<Vec<f64>> for AttributeValue {
    fn from(v: Vec<f64>) -> Self {
        AttributeValue::FloatVec(v)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(v: Vec<String>) -> Self {
        AttributeValue::StrVec(v)
    }
}

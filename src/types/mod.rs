//! # Values and Data Types
//!
//! Maps store [`Value`]s: a tagged variant with one arm per supported value
//! shape. Ordering, sizing, and serialization are owned by [`DataType`]
//! implementations rather than the values themselves, so a map can interpret
//! the same bytes with a cheaper fixed type (e.g. [`LongType`] keys) or with
//! the self-describing [`VariantType`].
//!
//! Built-in types:
//!
//! - [`VariantType`]: self-describing, any `Value`; the default for maps
//!   opened without explicit types. Values order by tag first, then content.
//! - [`LongType`], [`StringType`], [`BytesType`]: single-arm types with
//!   compact encodings.
//! - [`ArrayType`]: a fixed-length array of typed elements with per-element
//!   presence bytes, used by the transaction layer for its `(txId, logId,
//!   value)` triples and undo-log records.

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::{bail, ensure, Result};

use crate::encoding::{ByteReader, WriteBuffer};

const TAG_NULL: u8 = 0;
const TAG_LONG: u8 = 1;
const TAG_STR: u8 = 2;
const TAG_BYTES: u8 = 3;
const TAG_ARRAY: u8 = 4;

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Absence marker. Maps never store `Null` as a user value; the
    /// transaction layer uses it as the tombstone arm inside triples.
    Null,
    Long(i64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Value::Null => TAG_NULL,
            Value::Long(_) => TAG_LONG,
            Value::Str(_) => TAG_STR,
            Value::Bytes(_) => TAG_BYTES,
            Value::Array(_) => TAG_ARRAY,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
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

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

/// Capability set a map needs from its key and value types.
pub trait DataType: Send + Sync {
    /// Total order over the values this type accepts.
    fn compare(&self, a: &Value, b: &Value) -> Ordering;

    /// Estimated in-memory cost in bytes, used for page-split accounting and
    /// cache weighting.
    fn memory(&self, v: &Value) -> usize;

    fn write(&self, buf: &mut WriteBuffer, v: &Value) -> Result<()>;

    fn read(&self, r: &mut ByteReader<'_>) -> Result<Value>;
}

fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Signed 64-bit integers, zigzag varint encoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct LongType;

impl DataType for LongType {
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match (a, b) {
            (Value::Long(x), Value::Long(y)) => x.cmp(y),
            _ => variant_compare(a, b),
        }
    }

    fn memory(&self, _v: &Value) -> usize {
        8
    }

    fn write(&self, buf: &mut WriteBuffer, v: &Value) -> Result<()> {
        match v {
            Value::Long(x) => {
                buf.put_varint(zigzag_encode(*x));
                Ok(())
            }
            other => bail!("LongType cannot serialize {:?}", other),
        }
    }

    fn read(&self, r: &mut ByteReader<'_>) -> Result<Value> {
        Ok(Value::Long(zigzag_decode(r.get_varint()?)))
    }
}

/// Length-prefixed UTF-8 strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringType;

impl DataType for StringType {
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match (a, b) {
            (Value::Str(x), Value::Str(y)) => x.cmp(y),
            _ => variant_compare(a, b),
        }
    }

    fn memory(&self, v: &Value) -> usize {
        16 + v.as_str().map_or(0, str::len)
    }

    fn write(&self, buf: &mut WriteBuffer, v: &Value) -> Result<()> {
        match v {
            Value::Str(s) => {
                buf.put_varint(s.len() as u64);
                buf.put_slice(s.as_bytes());
                Ok(())
            }
            other => bail!("StringType cannot serialize {:?}", other),
        }
    }

    fn read(&self, r: &mut ByteReader<'_>) -> Result<Value> {
        let len = r.get_varint()? as usize;
        let bytes = r.get_slice(len)?;
        let s = std::str::from_utf8(bytes).map_err(|_| eyre::eyre!("invalid UTF-8 in string"))?;
        Ok(Value::Str(s.to_owned()))
    }
}

/// Length-prefixed raw byte arrays, ordered lexicographically.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesType;

impl DataType for BytesType {
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match (a, b) {
            (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
            _ => variant_compare(a, b),
        }
    }

    fn memory(&self, v: &Value) -> usize {
        16 + v.as_bytes().map_or(0, <[u8]>::len)
    }

    fn write(&self, buf: &mut WriteBuffer, v: &Value) -> Result<()> {
        match v {
            Value::Bytes(b) => {
                buf.put_varint(b.len() as u64);
                buf.put_slice(b);
                Ok(())
            }
            other => bail!("BytesType cannot serialize {:?}", other),
        }
    }

    fn read(&self, r: &mut ByteReader<'_>) -> Result<Value> {
        let len = r.get_varint()? as usize;
        Ok(Value::Bytes(r.get_slice(len)?.to_vec()))
    }
}

/// A fixed-length array of typed elements. Each element is written behind a
/// presence byte so `Null` arms round-trip. `Null` orders before any present
/// value in the element position.
pub struct ArrayType {
    element_types: Vec<Arc<dyn DataType>>,
}

impl ArrayType {
    pub fn new(element_types: Vec<Arc<dyn DataType>>) -> Self {
        Self { element_types }
    }

    fn as_elements<'v>(&self, v: &'v Value) -> Result<&'v [Value]> {
        let elements = v
            .as_array()
            .ok_or_else(|| eyre::eyre!("ArrayType cannot serialize {:?}", v))?;
        ensure!(
            elements.len() == self.element_types.len(),
            "array length {} does not match type arity {}",
            elements.len(),
            self.element_types.len()
        );
        Ok(elements)
    }
}

impl DataType for ArrayType {
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let (xs, ys) = match (a.as_array(), b.as_array()) {
            (Some(xs), Some(ys)) => (xs, ys),
            _ => return variant_compare(a, b),
        };
        for (i, t) in self.element_types.iter().enumerate() {
            let x = xs.get(i).unwrap_or(&Value::Null);
            let y = ys.get(i).unwrap_or(&Value::Null);
            let ord = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => t.compare(x, y),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    fn memory(&self, v: &Value) -> usize {
        let mut size = 16;
        if let Some(xs) = v.as_array() {
            for (i, t) in self.element_types.iter().enumerate() {
                if let Some(x) = xs.get(i) {
                    if !x.is_null() {
                        size += t.memory(x);
                    }
                }
            }
        }
        size
    }

    fn write(&self, buf: &mut WriteBuffer, v: &Value) -> Result<()> {
        let elements = self.as_elements(v)?;
        for (x, t) in elements.iter().zip(&self.element_types) {
            if x.is_null() {
                buf.put_u8(0);
            } else {
                buf.put_u8(1);
                t.write(buf, x)?;
            }
        }
        Ok(())
    }

    fn read(&self, r: &mut ByteReader<'_>) -> Result<Value> {
        let mut elements = Vec::with_capacity(self.element_types.len());
        for t in &self.element_types {
            if r.get_u8()? == 1 {
                elements.push(t.read(r)?);
            } else {
                elements.push(Value::Null);
            }
        }
        Ok(Value::Array(elements))
    }
}

/// Self-describing type accepting any [`Value`]. Each value is written as a
/// tag byte followed by its payload; mixed-tag comparisons order by tag.
#[derive(Debug, Default, Clone, Copy)]
pub struct VariantType;

fn variant_compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Long(x), Value::Long(y)) => x.cmp(y),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        (Value::Array(xs), Value::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys.iter()) {
                let ord = variant_compare(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => a.tag().cmp(&b.tag()),
    }
}

fn variant_memory(v: &Value) -> usize {
    match v {
        Value::Null => 1,
        Value::Long(_) => 8,
        Value::Str(s) => 16 + s.len(),
        Value::Bytes(b) => 16 + b.len(),
        Value::Array(xs) => 16 + xs.iter().map(variant_memory).sum::<usize>(),
    }
}

fn variant_write(buf: &mut WriteBuffer, v: &Value) {
    buf.put_u8(v.tag());
    match v {
        Value::Null => {}
        Value::Long(x) => buf.put_varint(zigzag_encode(*x)),
        Value::Str(s) => {
            buf.put_varint(s.len() as u64);
            buf.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_varint(b.len() as u64);
            buf.put_slice(b);
        }
        Value::Array(xs) => {
            buf.put_varint(xs.len() as u64);
            for x in xs {
                variant_write(buf, x);
            }
        }
    }
}

fn variant_read(r: &mut ByteReader<'_>) -> Result<Value> {
    let tag = r.get_u8()?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_LONG => Ok(Value::Long(zigzag_decode(r.get_varint()?))),
        TAG_STR => {
            let len = r.get_varint()? as usize;
            let bytes = r.get_slice(len)?;
            let s =
                std::str::from_utf8(bytes).map_err(|_| eyre::eyre!("invalid UTF-8 in string"))?;
            Ok(Value::Str(s.to_owned()))
        }
        TAG_BYTES => {
            let len = r.get_varint()? as usize;
            Ok(Value::Bytes(r.get_slice(len)?.to_vec()))
        }
        TAG_ARRAY => {
            let len = r.get_varint()? as usize;
            ensure!(len <= r.remaining(), "array length {} out of range", len);
            let mut xs = Vec::with_capacity(len);
            for _ in 0..len {
                xs.push(variant_read(r)?);
            }
            Ok(Value::Array(xs))
        }
        other => bail!("unknown value tag {}", other),
    }
}

impl DataType for VariantType {
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        variant_compare(a, b)
    }

    fn memory(&self, v: &Value) -> usize {
        variant_memory(v)
    }

    fn write(&self, buf: &mut WriteBuffer, v: &Value) -> Result<()> {
        variant_write(buf, v);
        Ok(())
    }

    fn read(&self, r: &mut ByteReader<'_>) -> Result<Value> {
        variant_read(r)
    }
}

/// The default type for maps opened without explicit types.
pub fn variant_type() -> Arc<dyn DataType> {
    Arc::new(VariantType)
}

pub fn string_type() -> Arc<dyn DataType> {
    Arc::new(StringType)
}

pub fn long_type() -> Arc<dyn DataType> {
    Arc::new(LongType)
}

pub fn bytes_type() -> Arc<dyn DataType> {
    Arc::new(BytesType)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(t: &dyn DataType, v: &Value) -> Value {
        let mut buf = WriteBuffer::new();
        t.write(&mut buf, v).unwrap();
        let mut r = ByteReader::new(buf.as_slice());
        let back = t.read(&mut r).unwrap();
        assert_eq!(r.remaining(), 0);
        back
    }

    #[test]
    fn long_type_round_trip_and_order() {
        let t = LongType;
        for v in [i64::MIN, -1, 0, 1, 240, 100_000, i64::MAX] {
            assert_eq!(round_trip(&t, &Value::Long(v)), Value::Long(v));
        }
        assert_eq!(
            t.compare(&Value::Long(-5), &Value::Long(3)),
            Ordering::Less
        );
    }

    #[test]
    fn string_type_round_trip() {
        let t = StringType;
        let v = Value::from("héllo, wörld");
        assert_eq!(round_trip(&t, &v), v);
        assert!(t.write(&mut WriteBuffer::new(), &Value::Long(1)).is_err());
    }

    #[test]
    fn array_type_preserves_null_arms() {
        let t = ArrayType::new(vec![long_type(), long_type(), variant_type()]);
        let triple = Value::Array(vec![Value::Long(7), Value::Long(3), Value::Null]);
        assert_eq!(round_trip(&t, &triple), triple);

        let with_value = Value::Array(vec![
            Value::Long(7),
            Value::Long(4),
            Value::from("payload"),
        ]);
        assert_eq!(round_trip(&t, &with_value), with_value);
    }

    #[test]
    fn array_type_orders_elementwise_with_null_first() {
        let t = ArrayType::new(vec![long_type(), long_type()]);
        let a = Value::Array(vec![Value::Long(1), Value::Long(5)]);
        let b = Value::Array(vec![Value::Long(1), Value::Long(9)]);
        let n = Value::Array(vec![Value::Long(1), Value::Null]);

        assert_eq!(t.compare(&a, &b), Ordering::Less);
        assert_eq!(t.compare(&n, &a), Ordering::Less);
        assert_eq!(t.compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn variant_type_round_trips_every_arm() {
        let t = VariantType;
        let values = [
            Value::Null,
            Value::Long(-123),
            Value::from("text"),
            Value::Bytes(vec![0, 1, 2, 255]),
            Value::Array(vec![Value::Long(1), Value::from("x"), Value::Null]),
        ];
        for v in &values {
            assert_eq!(&round_trip(&t, v), v);
        }
    }

    #[test]
    fn variant_type_orders_by_tag_then_value() {
        let t = VariantType;
        assert_eq!(
            t.compare(&Value::Long(99), &Value::from("a")),
            Ordering::Less
        );
        assert_eq!(
            t.compare(&Value::from("a"), &Value::from("b")),
            Ordering::Less
        );
        assert_eq!(t.compare(&Value::Null, &Value::Long(i64::MIN)), Ordering::Less);
    }

    #[test]
    fn corrupt_tags_are_rejected() {
        let mut r = ByteReader::new(&[9, 0, 0]);
        assert!(VariantType.read(&mut r).is_err());
    }
}

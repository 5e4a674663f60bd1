//! Canonical encoding for hash inputs
//!
//! A `serde::Serializer` that produces identical bytes for logically
//! identical data. The output is compact JSON with:
//!
//! - object keys sorted by UTF-8 byte order (map insertion order never matters)
//! - integers in plain decimal, floats in shortest round-trip decimal without
//!   exponent, integral floats below 2^53 written as integers, `-0` as `0`
//! - strings escaped the same way every time, byte strings only when valid UTF-8
//!
//! Content that has no canonical form (NaN, infinities, non-string map keys,
//! invalid UTF-8, duplicate keys) is rejected with
//! [`LedgerError::Serialization`]. Nothing is coerced: `serde_json::to_value`
//! would silently turn `f64::NAN` into `null`, which is exactly what a hash
//! input must never do.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::ser::{self, Serialize};
use serde_json::Value;

use crate::error::{LedgerError, Result};

/// 2^53, the first integer an f64 can no longer step through one by one
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Encode a value into canonical bytes
pub fn to_vec<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    value.serialize(Canonicalizer).map_err(LedgerError::from)
}

/// Encode a value into a canonical JSON string
pub fn to_string<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = to_vec(value)?;
    String::from_utf8(bytes).map_err(|e| LedgerError::InternalError {
        reason: format!("canonical encoder produced invalid UTF-8: {}", e),
    })
}

/// Convert a value into its canonical `serde_json::Value` form
///
/// The result re-encodes to the same canonical bytes as `value`.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    let bytes = to_vec(value)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Check that a value is canonically encodable without keeping the bytes
pub fn validate<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    to_vec(value).map(|_| ())
}

/// Error raised while encoding
#[derive(Debug)]
pub struct CanonicalError(String);

impl Display for CanonicalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CanonicalError {}

impl ser::Error for CanonicalError {
    fn custom<T: Display>(msg: T) -> Self {
        CanonicalError(msg.to_string())
    }
}

impl From<CanonicalError> for LedgerError {
    fn from(err: CanonicalError) -> Self {
        LedgerError::Serialization { reason: err.0 }
    }
}

fn encode_float(v: f64) -> std::result::Result<Vec<u8>, CanonicalError> {
    if !v.is_finite() {
        return Err(CanonicalError(format!(
            "non-finite number {} has no canonical encoding",
            v
        )));
    }
    if v == 0.0 {
        return Ok(b"0".to_vec());
    }
    if v.fract() == 0.0 && v.abs() < MAX_SAFE_INTEGER {
        return Ok((v as i64).to_string().into_bytes());
    }
    Ok(v.to_string().into_bytes())
}

fn encode_str(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 2);
    out.push(b'"');
    for ch in s.chars() {
        match ch {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            '\u{08}' => out.extend_from_slice(b"\\b"),
            '\u{0C}' => out.extend_from_slice(b"\\f"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes())
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
    out
}

fn single_entry(key: &str, inner: Vec<u8>) -> Vec<u8> {
    let mut out = vec![b'{'];
    out.extend(encode_str(key));
    out.push(b':');
    out.extend(inner);
    out.push(b'}');
    out
}

/// Turn an encoded key into the string it stands for.
///
/// Strings are used as-is; integers are stringified the way serde_json does.
fn decode_key(encoded: Vec<u8>) -> std::result::Result<String, CanonicalError> {
    if encoded.first() == Some(&b'"') {
        return serde_json::from_slice::<String>(&encoded)
            .map_err(|e| CanonicalError(format!("invalid map key: {}", e)));
    }
    let text = String::from_utf8(encoded)
        .map_err(|_| CanonicalError("map key must be a string".to_string()))?;
    if text.parse::<i128>().is_ok() || text.parse::<u128>().is_ok() {
        Ok(text)
    } else {
        Err(CanonicalError(format!(
            "map key must be a string or integer, got {}",
            text
        )))
    }
}

struct Canonicalizer;

impl ser::Serializer for Canonicalizer {
    type Ok = Vec<u8>;
    type Error = CanonicalError;
    type SerializeSeq = SeqEncoder;
    type SerializeTuple = SeqEncoder;
    type SerializeTupleStruct = SeqEncoder;
    type SerializeTupleVariant = TupleVariantEncoder;
    type SerializeMap = MapEncoder;
    type SerializeStruct = MapEncoder;
    type SerializeStructVariant = StructVariantEncoder;

    fn serialize_bool(self, v: bool) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(if v { b"true".to_vec() } else { b"false".to_vec() })
    }

    fn serialize_i8(self, v: i8) -> std::result::Result<Vec<u8>, CanonicalError> {
        self.serialize_i64(v as i64)
    }

    fn serialize_i16(self, v: i16) -> std::result::Result<Vec<u8>, CanonicalError> {
        self.serialize_i64(v as i64)
    }

    fn serialize_i32(self, v: i32) -> std::result::Result<Vec<u8>, CanonicalError> {
        self.serialize_i64(v as i64)
    }

    fn serialize_i64(self, v: i64) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(v.to_string().into_bytes())
    }

    fn serialize_i128(self, v: i128) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(v.to_string().into_bytes())
    }

    fn serialize_u8(self, v: u8) -> std::result::Result<Vec<u8>, CanonicalError> {
        self.serialize_u64(v as u64)
    }

    fn serialize_u16(self, v: u16) -> std::result::Result<Vec<u8>, CanonicalError> {
        self.serialize_u64(v as u64)
    }

    fn serialize_u32(self, v: u32) -> std::result::Result<Vec<u8>, CanonicalError> {
        self.serialize_u64(v as u64)
    }

    fn serialize_u64(self, v: u64) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(v.to_string().into_bytes())
    }

    fn serialize_u128(self, v: u128) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(v.to_string().into_bytes())
    }

    fn serialize_f32(self, v: f32) -> std::result::Result<Vec<u8>, CanonicalError> {
        encode_float(v as f64)
    }

    fn serialize_f64(self, v: f64) -> std::result::Result<Vec<u8>, CanonicalError> {
        encode_float(v)
    }

    fn serialize_char(self, v: char) -> std::result::Result<Vec<u8>, CanonicalError> {
        let mut buf = [0u8; 4];
        Ok(encode_str(v.encode_utf8(&mut buf)))
    }

    fn serialize_str(self, v: &str) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(encode_str(v))
    }

    fn serialize_bytes(self, v: &[u8]) -> std::result::Result<Vec<u8>, CanonicalError> {
        std::str::from_utf8(v)
            .map(encode_str)
            .map_err(|e| CanonicalError(format!("byte string is not valid UTF-8: {}", e)))
    }

    fn serialize_none(self) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(b"null".to_vec())
    }

    fn serialize_some<T: ?Sized + Serialize>(
        self,
        value: &T,
    ) -> std::result::Result<Vec<u8>, CanonicalError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(b"null".to_vec())
    }

    fn serialize_unit_struct(
        self,
        _name: &'static str,
    ) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(b"null".to_vec())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(encode_str(variant))
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> std::result::Result<Vec<u8>, CanonicalError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> std::result::Result<Vec<u8>, CanonicalError> {
        let inner = value.serialize(Canonicalizer)?;
        Ok(single_entry(variant, inner))
    }

    fn serialize_seq(self, len: Option<usize>) -> std::result::Result<SeqEncoder, CanonicalError> {
        Ok(SeqEncoder {
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> std::result::Result<SeqEncoder, CanonicalError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> std::result::Result<SeqEncoder, CanonicalError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> std::result::Result<TupleVariantEncoder, CanonicalError> {
        Ok(TupleVariantEncoder {
            variant,
            inner: SeqEncoder {
                items: Vec::with_capacity(len),
            },
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> std::result::Result<MapEncoder, CanonicalError> {
        Ok(MapEncoder::default())
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> std::result::Result<MapEncoder, CanonicalError> {
        Ok(MapEncoder::default())
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> std::result::Result<StructVariantEncoder, CanonicalError> {
        Ok(StructVariantEncoder {
            variant,
            inner: MapEncoder::default(),
        })
    }
}

struct SeqEncoder {
    items: Vec<Vec<u8>>,
}

impl SeqEncoder {
    fn push<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> std::result::Result<(), CanonicalError> {
        self.items.push(value.serialize(Canonicalizer)?);
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        let mut out = vec![b'['];
        for (i, item) in self.items.into_iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            out.extend(item);
        }
        out.push(b']');
        out
    }
}

impl ser::SerializeSeq for SeqEncoder {
    type Ok = Vec<u8>;
    type Error = CanonicalError;

    fn serialize_element<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> std::result::Result<(), CanonicalError> {
        self.push(value)
    }

    fn end(self) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTuple for SeqEncoder {
    type Ok = Vec<u8>;
    type Error = CanonicalError;

    fn serialize_element<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> std::result::Result<(), CanonicalError> {
        self.push(value)
    }

    fn end(self) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleStruct for SeqEncoder {
    type Ok = Vec<u8>;
    type Error = CanonicalError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> std::result::Result<(), CanonicalError> {
        self.push(value)
    }

    fn end(self) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(self.finish())
    }
}

struct TupleVariantEncoder {
    variant: &'static str,
    inner: SeqEncoder,
}

impl ser::SerializeTupleVariant for TupleVariantEncoder {
    type Ok = Vec<u8>;
    type Error = CanonicalError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> std::result::Result<(), CanonicalError> {
        self.inner.push(value)
    }

    fn end(self) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(single_entry(self.variant, self.inner.finish()))
    }
}

#[derive(Default)]
struct MapEncoder {
    entries: BTreeMap<String, Vec<u8>>,
    pending_key: Option<String>,
}

impl MapEncoder {
    fn insert(&mut self, key: String, value: Vec<u8>) -> std::result::Result<(), CanonicalError> {
        if self.entries.contains_key(&key) {
            return Err(CanonicalError(format!("duplicate key '{}'", key)));
        }
        self.entries.insert(key, value);
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        let mut out = vec![b'{'];
        for (i, (key, value)) in self.entries.into_iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            out.extend(encode_str(&key));
            out.push(b':');
            out.extend(value);
        }
        out.push(b'}');
        out
    }
}

impl ser::SerializeMap for MapEncoder {
    type Ok = Vec<u8>;
    type Error = CanonicalError;

    fn serialize_key<T: ?Sized + Serialize>(
        &mut self,
        key: &T,
    ) -> std::result::Result<(), CanonicalError> {
        let encoded = key.serialize(Canonicalizer)?;
        self.pending_key = Some(decode_key(encoded)?);
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> std::result::Result<(), CanonicalError> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| CanonicalError("map value serialized before its key".to_string()))?;
        let encoded = value.serialize(Canonicalizer)?;
        self.insert(key, encoded)
    }

    fn end(self) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(self.finish())
    }
}

impl ser::SerializeStruct for MapEncoder {
    type Ok = Vec<u8>;
    type Error = CanonicalError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> std::result::Result<(), CanonicalError> {
        let encoded = value.serialize(Canonicalizer)?;
        self.insert(key.to_string(), encoded)
    }

    fn end(self) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(self.finish())
    }
}

struct StructVariantEncoder {
    variant: &'static str,
    inner: MapEncoder,
}

impl ser::SerializeStructVariant for StructVariantEncoder {
    type Ok = Vec<u8>;
    type Error = CanonicalError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> std::result::Result<(), CanonicalError> {
        let encoded = value.serialize(Canonicalizer)?;
        self.inner.insert(key.to_string(), encoded)
    }

    fn end(self) -> std::result::Result<Vec<u8>, CanonicalError> {
        Ok(single_entry(self.variant, self.inner.finish()))
    }
}

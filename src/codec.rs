//! Value model and on-disk encoding.
//!
//! Tagged binary format. Every stored byte string starts with a one-byte
//! tag: `' '` for plain bytes (and ASCII text), `'U'` for text whose
//! in-memory form is multi-byte UTF-8. Keys are always stored in this
//! string form. Values in a non-`strings` cache carry a `' '` tag followed
//! by a structured serialization that round-trips every [`Value`] variant,
//! including nested lists. The empty byte string encodes an absent value.

use crate::error::{CacheError, Result};

/// Tag for plain byte payloads (and the structured form).
const TAG_PLAIN: u8 = b' ';
/// Tag for UTF-8 text payloads that contain non-ASCII characters.
const TAG_UNICODE: u8 = b'U';

// Node tags of the structured serialization.
const NODE_BYTES: u8 = 0;
const NODE_TEXT: u8 = 1;
const NODE_FALSE: u8 = 2;
const NODE_TRUE: u8 = 3;
const NODE_I64: u8 = 4;
const NODE_F64: u8 = 5;
const NODE_LIST: u8 = 6;

/// A key or value as seen by cache users.
///
/// A `strings` cache stores only `Bytes` and `Text`; a structured cache
/// stores every variant. Keys must be `Bytes` or `Text` in either mode.
#[derive(Debug, Clone)]
pub enum Value {
    Bytes(Vec<u8>),
    Text(String),
    Bool(bool),
    Int(i64),
    Float(f64),
    List(Vec<Value>),
}

impl Value {
    /// The raw key bytes, as hashed for bucket selection (pre-encoding).
    pub(crate) fn raw_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            Value::Text(s) => Ok(s.as_bytes()),
            other => Err(CacheError::Codec(format!(
                "cache keys must be byte strings or text, not {}",
                other.kind_name()
            ))),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "bytes",
            Value::Text(_) => "text",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::List(_) => "list",
        }
    }
}

/// Byte strings and text with identical bytes are the same cache key: the
/// string encoding drops the text marker for ASCII, so a key written as
/// `Text("a")` comes back from the file as `Bytes(b"a")`.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Text(b)) | (Value::Text(b), Value::Bytes(a)) => {
                a.as_slice() == b.as_bytes()
            }
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
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

/// Encode a value (or the absent sentinel) for storage.
///
/// `is_key` forces the string form regardless of the cache-wide `strings`
/// flag; keys are always stored tagged-raw so entry walks can compare them
/// byte-for-byte.
pub(crate) fn encode(value: Option<&Value>, strings: bool, is_key: bool) -> Result<Vec<u8>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };

    if strings || is_key {
        let mut out;
        match value {
            Value::Bytes(b) => {
                out = Vec::with_capacity(1 + b.len());
                out.push(TAG_PLAIN);
                out.extend_from_slice(b);
            }
            Value::Text(s) if s.is_ascii() => {
                out = Vec::with_capacity(1 + s.len());
                out.push(TAG_PLAIN);
                out.extend_from_slice(s.as_bytes());
            }
            Value::Text(s) => {
                out = Vec::with_capacity(1 + s.len());
                out.push(TAG_UNICODE);
                out.extend_from_slice(s.as_bytes());
            }
            other => {
                let what = if is_key { "cache keys" } else { "a strings cache" };
                return Err(CacheError::Codec(format!(
                    "{what} can hold only byte strings and text, not {}",
                    other.kind_name()
                )));
            }
        }
        return Ok(out);
    }

    let mut out = vec![TAG_PLAIN];
    serialize_node(value, &mut out);
    Ok(out)
}

/// Decode stored bytes back into a value. Empty input is the absent value.
pub(crate) fn decode(data: &[u8], strings: bool, is_key: bool) -> Result<Option<Value>> {
    let Some((&tag, rest)) = data.split_first() else {
        return Ok(None);
    };

    if tag == TAG_UNICODE {
        let s = String::from_utf8(rest.to_vec())
            .map_err(|e| CacheError::Codec(format!("invalid UTF-8 in text payload: {e}")))?;
        return Ok(Some(Value::Text(s)));
    }

    if strings || is_key {
        return Ok(Some(Value::Bytes(rest.to_vec())));
    }

    let (value, used) = deserialize_node(rest)?;
    if used != rest.len() {
        return Err(CacheError::Codec(format!(
            "{} trailing bytes after structured value",
            rest.len() - used
        )));
    }
    Ok(Some(value))
}

/// Serialize one node into `buf`. Lists recurse.
fn serialize_node(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Bytes(b) => {
            buf.push(NODE_BYTES);
            buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
            buf.extend_from_slice(b);
        }
        Value::Text(s) => {
            buf.push(NODE_TEXT);
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Bool(false) => buf.push(NODE_FALSE),
        Value::Bool(true) => buf.push(NODE_TRUE),
        Value::Int(v) => {
            buf.push(NODE_I64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Float(v) => {
            buf.push(NODE_F64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::List(items) => {
            buf.push(NODE_LIST);
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                serialize_node(item, buf);
            }
        }
    }
}

/// Deserialize one node from `data`. Returns `(value, bytes_consumed)`.
fn deserialize_node(data: &[u8]) -> Result<(Value, usize)> {
    let Some((&tag, rest)) = data.split_first() else {
        return Err(truncated());
    };

    match tag {
        NODE_FALSE => Ok((Value::Bool(false), 1)),
        NODE_TRUE => Ok((Value::Bool(true), 1)),

        NODE_I64 => {
            let bytes: [u8; 8] = rest.get(..8).ok_or_else(truncated)?.try_into().unwrap();
            Ok((Value::Int(i64::from_le_bytes(bytes)), 9))
        }

        NODE_F64 => {
            let bytes: [u8; 8] = rest.get(..8).ok_or_else(truncated)?.try_into().unwrap();
            Ok((Value::Float(f64::from_le_bytes(bytes)), 9))
        }

        NODE_BYTES => {
            let (payload, consumed) = length_prefixed(rest)?;
            Ok((Value::Bytes(payload.to_vec()), 1 + consumed))
        }

        NODE_TEXT => {
            let (payload, consumed) = length_prefixed(rest)?;
            let s = std::str::from_utf8(payload)
                .map_err(|e| CacheError::Codec(format!("invalid UTF-8 in text node: {e}")))?;
            Ok((Value::Text(s.to_string()), 1 + consumed))
        }

        NODE_LIST => {
            let bytes: [u8; 4] = rest.get(..4).ok_or_else(truncated)?.try_into().unwrap();
            let count = u32::from_le_bytes(bytes) as usize;
            let mut offset = 4;
            let mut items = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                let (item, consumed) = deserialize_node(&rest[offset..])?;
                items.push(item);
                offset += consumed;
            }
            Ok((Value::List(items), 1 + offset))
        }

        other => Err(CacheError::Codec(format!(
            "unknown structured tag 0x{other:02x}"
        ))),
    }
}

/// Split a `u32` LE length-prefixed payload off `data`.
fn length_prefixed(data: &[u8]) -> Result<(&[u8], usize)> {
    let bytes: [u8; 4] = data.get(..4).ok_or_else(truncated)?.try_into().unwrap();
    let len = u32::from_le_bytes(bytes) as usize;
    let payload = data.get(4..4 + len).ok_or_else(truncated)?;
    Ok((payload, 4 + len))
}

fn truncated() -> CacheError {
    CacheError::Codec("truncated structured value".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value, strings: bool, is_key: bool) -> Value {
        let bytes = encode(Some(&value), strings, is_key).expect("encode");
        decode(&bytes, strings, is_key)
            .expect("decode")
            .expect("present")
    }

    #[test]
    fn absent_value_is_the_empty_string() {
        assert!(encode(None, true, false).unwrap().is_empty());
        assert_eq!(decode(&[], true, false).unwrap(), None);
        assert_eq!(decode(&[], false, false).unwrap(), None);
    }

    #[test]
    fn strings_mode_tags_raw_bytes() {
        let bytes = encode(Some(&Value::from("def")), true, false).unwrap();
        assert_eq!(bytes, b" def");
        assert_eq!(round_trip(Value::from("def"), true, false), Value::from("def"));
    }

    #[test]
    fn unicode_text_gets_the_u_tag() {
        let bytes = encode(Some(&Value::from("héllo")), true, false).unwrap();
        assert_eq!(bytes[0], b'U');
        assert_eq!(
            round_trip(Value::from("héllo"), true, false),
            Value::Text("héllo".into())
        );
    }

    #[test]
    fn keys_use_the_string_form_in_structured_mode() {
        let bytes = encode(Some(&Value::from("k1")), false, true).unwrap();
        assert_eq!(bytes, b" k1");
    }

    #[test]
    fn ascii_text_and_bytes_are_the_same_key() {
        assert_eq!(Value::from("abc"), Value::from(b"abc".as_slice()));
        assert_ne!(Value::Text("é".into()), Value::Bytes(b"e".to_vec()));
    }

    #[test]
    fn structured_values_round_trip() {
        for v in [
            Value::Int(-7),
            Value::Float(2.5),
            Value::Bool(true),
            Value::Bool(false),
            Value::Bytes(vec![0, 255, 1]),
            Value::Text("héllo".into()),
            Value::List(vec![
                Value::Int(1),
                Value::List(vec![Value::from("nested")]),
                Value::Bool(false),
            ]),
        ] {
            assert_eq!(round_trip(v.clone(), false, false), v);
        }
    }

    #[test]
    fn structured_mode_keeps_bytes_and_text_distinct() {
        let b = encode(Some(&Value::Bytes(b"x".to_vec())), false, false).unwrap();
        let t = encode(Some(&Value::Text("x".into())), false, false).unwrap();
        assert_ne!(b, t);
        assert!(matches!(
            decode(&t, false, false).unwrap(),
            Some(Value::Text(_))
        ));
    }

    #[test]
    fn non_string_key_is_rejected() {
        assert!(encode(Some(&Value::Int(3)), false, true).is_err());
        assert!(Value::Int(3).raw_bytes().is_err());
    }

    #[test]
    fn non_string_value_rejected_in_strings_mode() {
        assert!(encode(Some(&Value::List(vec![])), true, false).is_err());
    }

    #[test]
    fn invalid_utf8_under_the_u_tag_fails() {
        let err = decode(b"U\xff\xfe", true, false).unwrap_err();
        assert!(matches!(err, CacheError::Codec(_)));
    }

    #[test]
    fn truncated_structured_value_fails() {
        let mut bytes = encode(Some(&Value::Int(42)), false, false).unwrap();
        bytes.truncate(4);
        assert!(decode(&bytes, false, false).is_err());
    }
}

//! Hand-rolled binary TLV encoding for a `serde_json::Value`, used by the
//! binary [`super::SerializerId`]. Keeps the dependency stack aligned with
//! the rest of the workspace (`serde_json` only) while giving the binary
//! serializer a genuinely different wire shape from JSON's text framing.

use serde_json::{Map, Number, Value};

use crate::error::RpcError;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_I64: u8 = 2;
const TAG_F64: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_ARRAY: u8 = 5;
const TAG_OBJECT: u8 = 6;

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(*b as u8);
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push(TAG_I64);
                out.extend_from_slice(&i.to_le_bytes());
            } else {
                out.push(TAG_F64);
                out.extend_from_slice(&n.as_f64().unwrap_or_default().to_le_bytes());
            }
        }
        Value::String(s) => {
            out.push(TAG_STR);
            write_bytes(s.as_bytes(), out);
        }
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_into(item, out);
            }
        }
        Value::Object(map) => {
            out.push(TAG_OBJECT);
            out.extend_from_slice(&(map.len() as u32).to_le_bytes());
            for (key, item) in map {
                write_bytes(key.as_bytes(), out);
                encode_into(item, out);
            }
        }
    }
}

fn write_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

pub fn decode(bytes: &[u8]) -> Result<Value, RpcError> {
    let mut cursor = Cursor { bytes, pos: 0 };
    decode_value(&mut cursor)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], RpcError> {
        let end = self.pos.checked_add(n).ok_or(truncated())?;
        let slice = self.bytes.get(self.pos..end).ok_or_else(truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, RpcError> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, RpcError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn take_string(&mut self) -> Result<String, RpcError> {
        let len = self.take_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| RpcError::TypeMismatch {
                expected: "utf-8 string".into(),
                actual: "invalid utf-8 bytes".into(),
            })
    }
}

fn truncated() -> RpcError {
    RpcError::TypeMismatch {
        expected: "complete binary value".into(),
        actual: "truncated buffer".into(),
    }
}

fn decode_value(cursor: &mut Cursor<'_>) -> Result<Value, RpcError> {
    let tag = cursor.take_u8()?;
    Ok(match tag {
        TAG_NULL => Value::Null,
        TAG_BOOL => Value::Bool(cursor.take_u8()? != 0),
        TAG_I64 => {
            let bytes = cursor.take(8)?;
            Value::Number(Number::from(i64::from_le_bytes(bytes.try_into().unwrap())))
        }
        TAG_F64 => {
            let bytes = cursor.take(8)?;
            let f = f64::from_le_bytes(bytes.try_into().unwrap());
            Value::Number(Number::from_f64(f).unwrap_or_else(|| Number::from(0)))
        }
        TAG_STR => Value::String(cursor.take_string()?),
        TAG_ARRAY => {
            let len = cursor.take_u32()? as usize;
            let mut items = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                items.push(decode_value(cursor)?);
            }
            Value::Array(items)
        }
        TAG_OBJECT => {
            let len = cursor.take_u32()? as usize;
            let mut map = Map::with_capacity(len.min(4096));
            for _ in 0..len {
                let key = cursor.take_string()?;
                let value = decode_value(cursor)?;
                map.insert(key, value);
            }
            Value::Object(map)
        }
        other => {
            return Err(RpcError::TypeMismatch {
                expected: "known binary tag".into(),
                actual: format!("tag {other}"),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_nested_values() {
        let value = json!({
            "name": "test",
            "count": 3,
            "ratio": 1.5,
            "flags": [true, false, null],
            "nested": { "a": 1, "b": "two" },
        });
        let encoded = encode(&value);
        let decoded = decode(&encoded).expect("decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn rejects_truncated_buffers() {
        let value = json!({"a": "bcdef"});
        let mut encoded = encode(&value);
        encoded.truncate(encoded.len() - 2);
        assert!(decode(&encoded).is_err());
    }
}

//! Codec for encoding and decoding HTSP messages.
//!
//! Frame format:
//! ```text
//! +-------------+------------------------------------------+
//! | Length      | Body: field*                             |
//! | u32 BE      |                                          |
//! +-------------+------------------------------------------+
//!
//! field:
//! +--------+---------+-----------+--------+----------------+
//! | Type   | NameLen | DataLen   | Name   | Data           |
//! | u8     | u8      | u32 BE    |        |                |
//! +--------+---------+-----------+--------+----------------+
//! ```
//!
//! Integers are carried as S64 in the fewest little-endian bytes needed
//! (zero takes no bytes). Map and list data is itself a sequence of fields;
//! list items have an empty name.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::*;

/// Size of the frame length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of a field header: type + name length + data length.
const FIELD_HEADER_SIZE: usize = 6;

/// Deepest map/list nesting accepted by the decoder.
pub const MAX_NESTING: usize = 32;

/// Encode a message into a length-prefixed frame.
pub fn encode_message(msg: &Message) -> Result<Bytes, ProtocolError> {
    let body = encode_body(msg)?;
    let body_len = u32::try_from(body.len())
        .map_err(|_| ProtocolError::EncodeError("body exceeds u32 length".to_string()))?;
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body_len, MAX_FRAME_SIZE));
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.put_u32(body_len);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Encode only the field sequence of a message, without the length prefix.
pub fn encode_body(msg: &Message) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    for (name, value) in msg.fields() {
        encode_field(&mut buf, name, value)?;
    }
    Ok(buf.freeze())
}

fn encode_field(buf: &mut BytesMut, name: &str, value: &Value) -> Result<(), ProtocolError> {
    let name_bytes = name.as_bytes();
    if name_bytes.len() > u8::MAX as usize {
        return Err(ProtocolError::EncodeError(format!(
            "field name too long: {} bytes",
            name_bytes.len()
        )));
    }

    let mut data = BytesMut::new();
    match value {
        Value::Map(map) => {
            for (k, v) in map.fields() {
                encode_field(&mut data, k, v)?;
            }
        }
        Value::S64(v) => encode_s64(&mut data, *v),
        Value::Str(s) => data.put_slice(s.as_bytes()),
        Value::Bin(b) => data.put_slice(b),
        Value::List(items) => {
            for item in items {
                encode_field(&mut data, "", item)?;
            }
        }
    }

    let data_len = u32::try_from(data.len())
        .map_err(|_| ProtocolError::EncodeError(format!("field '{}' too large", name)))?;

    buf.put_u8(value.field_type().into());
    buf.put_u8(name_bytes.len() as u8);
    buf.put_u32(data_len);
    buf.put_slice(name_bytes);
    buf.put_slice(&data);
    Ok(())
}

fn encode_s64(buf: &mut BytesMut, value: i64) {
    let mut u = value as u64;
    while u != 0 {
        buf.put_u8(u as u8);
        u >>= 8;
    }
}

fn decode_s64(data: &[u8], name: &str) -> Result<i64, ProtocolError> {
    if data.len() > 8 {
        return Err(ProtocolError::InvalidS64 {
            field: name.to_string(),
            len: data.len(),
        });
    }
    let u = data
        .iter()
        .rev()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    Ok(u as i64)
}

/// Try to read the body length from the start of a buffer.
/// Returns None if there's not enough data yet.
pub fn decode_length(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&buf[..LENGTH_PREFIX_SIZE]);
    let body_len = u32::from_be_bytes(prefix);
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body_len, MAX_FRAME_SIZE));
    }

    Ok(Some(body_len as usize))
}

/// Decode a message from a complete frame body (after the length prefix).
pub fn decode_message(mut body: Bytes) -> Result<Message, ProtocolError> {
    decode_map(&mut body, 0)
}

/// Decode a frame body and classify it as reply, notification or neither.
pub fn decode_inbound(body: Bytes) -> Result<Inbound, ProtocolError> {
    decode_message(body).map(Inbound::classify)
}

fn decode_map(buf: &mut Bytes, depth: usize) -> Result<Message, ProtocolError> {
    let mut msg = Message::new();
    while buf.has_remaining() {
        let (name, value) = decode_field(buf, depth)?;
        msg.push_field(name, value);
    }
    Ok(msg)
}

fn decode_list(buf: &mut Bytes, depth: usize) -> Result<Vec<Value>, ProtocolError> {
    let mut items = Vec::new();
    while buf.has_remaining() {
        let (_, value) = decode_field(buf, depth)?;
        items.push(value);
    }
    Ok(items)
}

fn decode_field(buf: &mut Bytes, depth: usize) -> Result<(String, Value), ProtocolError> {
    if buf.remaining() < FIELD_HEADER_SIZE {
        return Err(ProtocolError::IncompleteFrame {
            expected: FIELD_HEADER_SIZE,
            actual: buf.remaining(),
        });
    }
    let type_tag = buf.get_u8();
    let name_len = buf.get_u8() as usize;
    let data_len = buf.get_u32() as usize;

    let field_type = FieldType::try_from(type_tag).map_err(ProtocolError::UnknownFieldType)?;

    let needed = name_len + data_len;
    if buf.remaining() < needed {
        return Err(ProtocolError::IncompleteFrame {
            expected: needed,
            actual: buf.remaining(),
        });
    }

    let name_bytes = buf.copy_to_bytes(name_len);
    let name = String::from_utf8(name_bytes.to_vec())
        .map_err(|_| ProtocolError::InvalidUtf8("field name".to_string()))?;
    let mut data = buf.copy_to_bytes(data_len);

    let value = match field_type {
        FieldType::Map | FieldType::List if depth >= MAX_NESTING => {
            return Err(ProtocolError::NestingTooDeep(MAX_NESTING));
        }
        FieldType::Map => Value::Map(decode_map(&mut data, depth + 1)?),
        FieldType::List => Value::List(decode_list(&mut data, depth + 1)?),
        FieldType::S64 => Value::S64(decode_s64(&data, &name)?),
        FieldType::Str => Value::Str(
            String::from_utf8(data.to_vec())
                .map_err(|_| ProtocolError::InvalidUtf8(format!("field '{}'", name)))?,
        ),
        FieldType::Bin => Value::Bin(data.to_vec()),
    };

    Ok((name, value))
}

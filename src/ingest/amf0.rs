// AMF0 codec
// The command-message subset of AMF0 used by RTMP connect/publish/play

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// AMF0 type markers
const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_LONG_STRING: u8 = 0x0C;

/// Guard against pathological nesting.
const MAX_DEPTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum AmfError {
    #[error("unexpected end of AMF data")]
    UnexpectedEof,
    #[error("unsupported AMF0 marker 0x{0:02x}")]
    UnknownMarker(u8),
    #[error("AMF0 nesting too deep")]
    NestingTooDeep,
    #[error("invalid UTF-8 in AMF0 string")]
    InvalidUtf8,
}

/// An AMF0 value. Objects keep their key order so re-encoded commands stay
/// byte-stable.
#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, AmfValue)>),
    EcmaArray(Vec<(String, AmfValue)>),
    Null,
    Undefined,
}

impl AmfValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Look up an object/ECMA-array property.
    pub fn property(&self, key: &str) -> Option<&AmfValue> {
        match self {
            AmfValue::Object(props) | AmfValue::EcmaArray(props) => {
                props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }
}

/// Decode a single AMF0 value from the buffer.
pub fn decode(buf: &mut Bytes) -> Result<AmfValue, AmfError> {
    decode_at_depth(buf, 0)
}

/// Decode values until the buffer is exhausted (the shape of an RTMP command
/// body: name, transaction id, then arguments).
pub fn decode_all(buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
    let mut values = Vec::new();
    while buf.has_remaining() {
        values.push(decode_at_depth(buf, 0)?);
    }
    Ok(values)
}

fn decode_at_depth(buf: &mut Bytes, depth: usize) -> Result<AmfValue, AmfError> {
    if depth > MAX_DEPTH {
        return Err(AmfError::NestingTooDeep);
    }
    if buf.is_empty() {
        return Err(AmfError::UnexpectedEof);
    }

    let marker = buf.get_u8();
    match marker {
        MARKER_NUMBER => {
            if buf.remaining() < 8 {
                return Err(AmfError::UnexpectedEof);
            }
            Ok(AmfValue::Number(buf.get_f64()))
        }
        MARKER_BOOLEAN => {
            if buf.is_empty() {
                return Err(AmfError::UnexpectedEof);
            }
            Ok(AmfValue::Boolean(buf.get_u8() != 0))
        }
        MARKER_STRING => Ok(AmfValue::String(read_utf8(buf)?)),
        MARKER_LONG_STRING => Ok(AmfValue::String(read_utf8_long(buf)?)),
        MARKER_OBJECT => Ok(AmfValue::Object(read_properties(buf, depth)?)),
        MARKER_ECMA_ARRAY => {
            if buf.remaining() < 4 {
                return Err(AmfError::UnexpectedEof);
            }
            // The count is a hint only
            let _count = buf.get_u32();
            Ok(AmfValue::EcmaArray(read_properties(buf, depth)?))
        }
        MARKER_NULL => Ok(AmfValue::Null),
        MARKER_UNDEFINED => Ok(AmfValue::Undefined),
        other => Err(AmfError::UnknownMarker(other)),
    }
}

fn read_properties(
    buf: &mut Bytes,
    depth: usize,
) -> Result<Vec<(String, AmfValue)>, AmfError> {
    let mut props = Vec::new();
    loop {
        let key = read_utf8(buf)?;
        if key.is_empty() {
            if buf.is_empty() {
                // Some encoders omit the trailing end marker
                break;
            }
            let marker = buf.get_u8();
            if marker == MARKER_OBJECT_END {
                break;
            }
            // Lenient: treat anything else after an empty key as the end
            break;
        }
        let value = decode_at_depth(buf, depth + 1)?;
        props.push((key, value));
    }
    Ok(props)
}

fn read_utf8(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 2 {
        return Err(AmfError::UnexpectedEof);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(AmfError::UnexpectedEof);
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

fn read_utf8_long(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 4 {
        return Err(AmfError::UnexpectedEof);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(AmfError::UnexpectedEof);
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// Encode a single AMF0 value.
pub fn encode(value: &AmfValue, buf: &mut BytesMut) {
    match value {
        AmfValue::Number(n) => {
            buf.put_u8(MARKER_NUMBER);
            buf.put_f64(*n);
        }
        AmfValue::Boolean(b) => {
            buf.put_u8(MARKER_BOOLEAN);
            buf.put_u8(u8::from(*b));
        }
        AmfValue::String(s) => {
            if s.len() > u16::MAX as usize {
                buf.put_u8(MARKER_LONG_STRING);
                buf.put_u32(s.len() as u32);
            } else {
                buf.put_u8(MARKER_STRING);
                buf.put_u16(s.len() as u16);
            }
            buf.put_slice(s.as_bytes());
        }
        AmfValue::Object(props) => {
            buf.put_u8(MARKER_OBJECT);
            put_properties(props, buf);
        }
        AmfValue::EcmaArray(props) => {
            buf.put_u8(MARKER_ECMA_ARRAY);
            buf.put_u32(props.len() as u32);
            put_properties(props, buf);
        }
        AmfValue::Null => buf.put_u8(MARKER_NULL),
        AmfValue::Undefined => buf.put_u8(MARKER_UNDEFINED),
    }
}

/// Encode a sequence of values into one command body.
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut buf = BytesMut::new();
    for value in values {
        encode(value, &mut buf);
    }
    buf.freeze()
}

fn put_properties(props: &[(String, AmfValue)], buf: &mut BytesMut) {
    for (key, value) in props {
        buf.put_u16(key.len() as u16);
        buf.put_slice(key.as_bytes());
        encode(value, buf);
    }
    buf.put_u16(0);
    buf.put_u8(MARKER_OBJECT_END);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_round_trip() {
        let mut buf = BytesMut::new();
        encode(&AmfValue::Number(1935.5), &mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(decode(&mut bytes).unwrap(), AmfValue::Number(1935.5));
    }

    #[test]
    fn test_connect_command_shape() {
        // The body of a typical `connect` command
        let values = vec![
            AmfValue::String("connect".to_string()),
            AmfValue::Number(1.0),
            AmfValue::Object(vec![
                ("app".to_string(), AmfValue::String("live".to_string())),
                ("type".to_string(), AmfValue::String("nonprivate".to_string())),
                (
                    "tcUrl".to_string(),
                    AmfValue::String("rtmp://127.0.0.1:1935/live".to_string()),
                ),
            ]),
        ];

        let mut bytes = encode_all(&values);
        let decoded = decode_all(&mut bytes).unwrap();

        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].as_str(), Some("connect"));
        assert_eq!(decoded[1].as_number(), Some(1.0));
        assert_eq!(
            decoded[2].property("app").and_then(AmfValue::as_str),
            Some("live")
        );
        // Key order survives the round trip
        assert_eq!(decoded[2], values[2]);
    }

    #[test]
    fn test_missing_object_end_is_tolerated() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x03); // object
        buf.put_u16(3);
        buf.put_slice(b"app");
        encode(&AmfValue::String("live".to_string()), &mut buf);
        buf.put_u16(0); // empty key, then nothing instead of 0x09

        let mut bytes = buf.freeze();
        let value = decode(&mut bytes).unwrap();
        assert_eq!(value.property("app").and_then(AmfValue::as_str), Some("live"));
    }

    #[test]
    fn test_truncated_input() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x00); // number marker, then only 4 of 8 bytes
        buf.put_u32(0);
        let mut bytes = buf.freeze();
        assert!(matches!(decode(&mut bytes), Err(AmfError::UnexpectedEof)));
    }

    #[test]
    fn test_unknown_marker_rejected() {
        let mut bytes = Bytes::from_static(&[0x42]);
        assert!(matches!(
            decode(&mut bytes),
            Err(AmfError::UnknownMarker(0x42))
        ));
    }

    #[test]
    fn test_ecma_array() {
        let values = vec![AmfValue::EcmaArray(vec![
            ("duration".to_string(), AmfValue::Number(0.0)),
            ("encoder".to_string(), AmfValue::String("obs".to_string())),
        ])];
        let mut bytes = encode_all(&values);
        let decoded = decode_all(&mut bytes).unwrap();
        assert_eq!(decoded, values);
    }
}

//! CBOR decoding for `WebAuthn` structures
//!
//! Attestation objects, COSE keys and extension maps use a small profile of
//! RFC 8949: definite lengths only, no tags, text or integer map keys. Input
//! is first walked header by header so malformed or hostile buffers are
//! rejected up front, then the exact item slice is handed to `ciborium`.

use crate::error::{Error, Result};
use ciborium::value::Value;

/// Maximum nesting of arrays and maps accepted from an authenticator
pub const MAX_DEPTH: usize = 16;

const MAJOR_UNSIGNED: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_TAG: u8 = 6;
const MAJOR_SIMPLE: u8 = 7;

/// Decode a buffer that must contain exactly one CBOR item
///
/// # Errors
///
/// Returns `Error::Format` if the buffer is malformed, truncated, uses a
/// construct outside the profile, or has bytes left over after the item.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let (value, consumed) = decode_prefix(bytes)?;
    if consumed != bytes.len() {
        return Err(Error::Format(format!(
            "{} trailing bytes after CBOR item",
            bytes.len() - consumed
        )));
    }
    Ok(value)
}

/// Decode the leading CBOR item of a buffer
///
/// # Returns
/// The decoded value and the number of bytes it occupied
///
/// # Errors
///
/// Returns `Error::Format` if the leading item is malformed or truncated.
pub fn decode_prefix(bytes: &[u8]) -> Result<(Value, usize)> {
    let end = item_end(bytes, 0, 0)?;
    let value: Value = ciborium::de::from_reader(&bytes[..end])
        .map_err(|e| Error::Format(format!("Invalid CBOR: {e}")))?;
    check_unique_keys(&value)?;
    Ok((value, end))
}

/// Look up a text key in a CBOR map
#[must_use]
pub fn map_get_text<'a>(map: &'a Value, key: &str) -> Option<&'a Value> {
    map.as_map()?
        .iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

/// Look up an integer key in a CBOR map
#[must_use]
pub fn map_get_int(map: &Value, key: i64) -> Option<&Value> {
    map.as_map()?
        .iter()
        .find(|(k, _)| k.as_integer().map(i128::from) == Some(i128::from(key)))
        .map(|(_, v)| v)
}

/// Read a value as a signed 64-bit integer
#[must_use]
pub fn as_i64(value: &Value) -> Option<i64> {
    value.as_integer().and_then(|i| i64::try_from(i).ok())
}

/// Fetch a required byte-string entry from a map keyed by text
///
/// # Errors
///
/// Returns `Error::Format` if the key is missing or not a byte string.
pub fn required_bytes<'a>(map: &'a Value, key: &str) -> Result<&'a [u8]> {
    map_get_text(map, key)
        .and_then(Value::as_bytes)
        .map(Vec::as_slice)
        .ok_or_else(|| Error::Format(format!("Missing or invalid '{key}' byte string")))
}

/// Fetch a required text entry from a map keyed by text
///
/// # Errors
///
/// Returns `Error::Format` if the key is missing or not a text string.
pub fn required_text<'a>(map: &'a Value, key: &str) -> Result<&'a str> {
    map_get_text(map, key)
        .and_then(Value::as_text)
        .ok_or_else(|| Error::Format(format!("Missing or invalid '{key}' text string")))
}

/// Walk one item starting at `pos` and return the offset just past it
fn item_end(buf: &[u8], pos: usize, depth: usize) -> Result<usize> {
    if depth > MAX_DEPTH {
        return Err(Error::Format(format!(
            "CBOR nesting deeper than {MAX_DEPTH}"
        )));
    }

    let initial = *buf
        .get(pos)
        .ok_or_else(|| Error::Format("Truncated CBOR: missing item header".to_string()))?;
    let major = initial >> 5;
    let info = initial & 0x1f;
    let (argument, mut cursor) = read_argument(buf, pos + 1, major, info)?;

    match major {
        MAJOR_UNSIGNED | MAJOR_NEGATIVE => Ok(cursor),
        MAJOR_BYTES | MAJOR_TEXT => {
            let len = length_within(buf, cursor, argument)?;
            Ok(cursor + len)
        }
        MAJOR_ARRAY => {
            // every item needs at least one byte
            length_within(buf, cursor, argument)?;
            for _ in 0..argument {
                cursor = item_end(buf, cursor, depth + 1)?;
            }
            Ok(cursor)
        }
        MAJOR_MAP => {
            length_within(buf, cursor, argument.saturating_mul(2))?;
            for _ in 0..argument {
                let key_major = buf.get(cursor).map(|b| b >> 5);
                if !matches!(
                    key_major,
                    Some(MAJOR_UNSIGNED | MAJOR_NEGATIVE | MAJOR_TEXT)
                ) {
                    return Err(Error::Format(
                        "CBOR map keys must be integers or text strings".to_string(),
                    ));
                }
                cursor = item_end(buf, cursor, depth + 1)?;
                cursor = item_end(buf, cursor, depth + 1)?;
            }
            Ok(cursor)
        }
        MAJOR_TAG => Err(Error::Format("CBOR tags are not supported".to_string())),
        _ => match info {
            // false, true, null, undefined and the three float widths
            20..=23 | 25..=27 => Ok(cursor),
            _ => Err(Error::Format(format!(
                "Unsupported CBOR simple value {info}"
            ))),
        },
    }
}

/// Decode the header argument, returning it with the offset after the header
fn read_argument(buf: &[u8], pos: usize, major: u8, info: u8) -> Result<(u64, usize)> {
    let width = match info {
        0..=23 => return Ok((u64::from(info), pos)),
        24 => 1,
        25 => 2,
        26 => 4,
        27 => 8,
        28..=30 => {
            return Err(Error::Format(format!(
                "Reserved CBOR additional information {info}"
            )))
        }
        _ if major == MAJOR_SIMPLE => {
            return Err(Error::Format("Unexpected CBOR break code".to_string()))
        }
        _ => {
            return Err(Error::Format(
                "Indefinite-length CBOR items are not supported".to_string(),
            ))
        }
    };

    let bytes = buf
        .get(pos..pos + width)
        .ok_or_else(|| Error::Format("Truncated CBOR: incomplete header".to_string()))?;
    let argument = bytes
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    Ok((argument, pos + width))
}

/// Ensure `len` bytes remain after `pos`
fn length_within(buf: &[u8], pos: usize, len: u64) -> Result<usize> {
    let remaining = buf.len().saturating_sub(pos);
    match usize::try_from(len) {
        Ok(len) if len <= remaining => Ok(len),
        _ => Err(Error::Format(format!(
            "Truncated CBOR: length {len} exceeds remaining {remaining} bytes"
        ))),
    }
}

/// Orderable form of a map key; the header walk only admits integers and text
#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum MapKey<'a> {
    Int(i128),
    Text(&'a str),
}

fn check_unique_keys(value: &Value) -> Result<()> {
    match value {
        Value::Map(entries) => {
            let mut keys = entries
                .iter()
                .map(|(key, _)| match key {
                    Value::Integer(i) => Ok(MapKey::Int(i128::from(*i))),
                    Value::Text(text) => Ok(MapKey::Text(text)),
                    _ => Err(Error::Format(
                        "CBOR map keys must be integers or text".to_string(),
                    )),
                })
                .collect::<Result<Vec<_>>>()?;
            keys.sort_unstable();
            if keys.windows(2).any(|pair| pair[0] == pair[1]) {
                return Err(Error::Format("Duplicate key in CBOR map".to_string()));
            }
            entries
                .iter()
                .try_for_each(|(_, item)| check_unique_keys(item))
        }
        Value::Array(items) => items.iter().try_for_each(check_unique_keys),
        _ => Ok(()),
    }
}

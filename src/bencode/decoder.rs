use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use std::collections::BTreeMap;
use tracing::instrument;

/// Decodes a single bencode value from the front of `bytes`.
///
/// Returns the decoded value together with the number of bytes consumed,
/// so callers can keep parsing a stream that carries trailing data (a
/// tracker response body, for instance, is one value followed by nothing,
/// while a metainfo file embeds the `info` dict mid-buffer).
///
/// Dispatch is on the first byte:
/// - `i` starts an integer (`i<decimal>e`)
/// - a decimal digit starts a byte string (`<length>:<data>`)
/// - `l` starts a list, `d` starts a dictionary, both terminated by `e`
///
/// # Errors
/// * `UnexpectedEof` - the input ends before the value is complete
/// * `InvalidFormat` - an unexpected byte where a type marker is required
/// * `InvalidInteger` / `InvalidStringLength` - malformed numeric bodies
#[instrument(skip(bytes), level = "trace")]
pub fn decode(bytes: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    decode_value(bytes, 0)
}

fn byte_at(bytes: &[u8], at: usize) -> BencodeResult<u8> {
    bytes.get(at).copied().ok_or(BencodeError::UnexpectedEof)
}

/// Locates the next `delimiter` at or after `at` and returns the span
/// before it plus the position just past the delimiter.
fn span_until(bytes: &[u8], at: usize, delimiter: u8) -> BencodeResult<(&[u8], usize)> {
    let relative = bytes[at.min(bytes.len())..]
        .iter()
        .position(|&b| b == delimiter)
        .ok_or(BencodeError::UnexpectedEof)?;
    Ok((&bytes[at..at + relative], at + relative + 1))
}

/// Decodes a bencode integer in the form `i<number>e`.
///
/// The body is validated strictly:
/// - it must contain at least one digit (`ie` is rejected)
/// - leading zeros are rejected except for the single literal `0`
/// - `-0` is rejected
///
/// Returns the value and the position just past the closing `e`.
///
/// # Example
/// For input `i42e` at position 0, this returns `(42, 4)`.
pub fn decode_integer(bytes: &[u8], at: usize) -> BencodeResult<(i64, usize)> {
    if byte_at(bytes, at)? != b'i' {
        return Err(BencodeError::InvalidFormat(
            "Integer must start with 'i'".to_string(),
        ));
    }

    let (body, end) = span_until(bytes, at + 1, b'e')?;

    let digits = match body.split_first() {
        Some((b'-', rest)) => {
            if rest.first() == Some(&b'0') {
                // covers both "-0" and "-0<digits>"
                return Err(BencodeError::InvalidInteger);
            }
            rest
        }
        _ => body,
    };

    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(BencodeError::InvalidInteger);
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(BencodeError::InvalidInteger);
    }

    let text = std::str::from_utf8(body).map_err(|_| BencodeError::InvalidInteger)?;
    let value = text
        .parse::<i64>()
        .map_err(|_| BencodeError::InvalidInteger)?;
    Ok((value, end))
}

/// Decodes a bencode byte string in the form `<length>:<data>`.
///
/// The length prefix must be a run of decimal digits; a leading `-`
/// (negative length) or any other non-digit byte fails with
/// `InvalidStringLength`. The data bytes are returned raw, never passed
/// through a text codec; dictionary keys and the `pieces` digest blob
/// both rely on that.
///
/// # Example
/// For input `5:hello` at position 0, this returns `(b"hello", 7)`.
pub fn decode_string(bytes: &[u8], at: usize) -> BencodeResult<(Vec<u8>, usize)> {
    if byte_at(bytes, at)? == b'-' {
        return Err(BencodeError::InvalidStringLength);
    }

    let (length_digits, data_start) = span_until(bytes, at, b':')?;
    if length_digits.is_empty() || !length_digits.iter().all(u8::is_ascii_digit) {
        return Err(BencodeError::InvalidStringLength);
    }

    let text =
        std::str::from_utf8(length_digits).map_err(|_| BencodeError::InvalidStringLength)?;
    let length = text
        .parse::<usize>()
        .map_err(|_| BencodeError::InvalidStringLength)?;

    let data_end = data_start
        .checked_add(length)
        .ok_or(BencodeError::InvalidStringLength)?;
    if data_end > bytes.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    Ok((bytes[data_start..data_end].to_vec(), data_end))
}

/// Decodes a bencode list in the form `l<items>e`, recursively decoding
/// each element until the closing `e`.
fn decode_list(bytes: &[u8], at: usize) -> BencodeResult<(Vec<BencodeValue>, usize)> {
    if byte_at(bytes, at)? != b'l' {
        return Err(BencodeError::InvalidFormat(
            "List must start with 'l'".to_string(),
        ));
    }

    let mut list = Vec::new();
    let mut cursor = at + 1;

    while byte_at(bytes, cursor)? != b'e' {
        let (item, next) = decode_value(bytes, cursor)?;
        list.push(item);
        cursor = next;
    }

    Ok((list, cursor + 1))
}

/// Decodes a bencode dictionary in the form `d<k1><v1>...<kn><vn>e`.
///
/// Keys must be byte strings; values may be any bencode value. A
/// duplicated key keeps the last occurrence. Keys land in a `BTreeMap`,
/// so iteration order is ascending raw-byte order regardless of the
/// order on the wire.
fn decode_dict(
    bytes: &[u8],
    at: usize,
) -> BencodeResult<(BTreeMap<Vec<u8>, BencodeValue>, usize)> {
    if byte_at(bytes, at)? != b'd' {
        return Err(BencodeError::InvalidFormat(
            "Dictionary must start with 'd'".to_string(),
        ));
    }

    let mut dict = BTreeMap::new();
    let mut cursor = at + 1;

    while byte_at(bytes, cursor)? != b'e' {
        let (key, after_key) = decode_string(bytes, cursor)?;
        let (value, after_value) = decode_value(bytes, after_key)?;
        dict.insert(key, value);
        cursor = after_value;
    }

    Ok((dict, cursor + 1))
}

fn decode_value(bytes: &[u8], at: usize) -> BencodeResult<(BencodeValue, usize)> {
    match byte_at(bytes, at)? {
        b'0'..=b'9' => decode_string(bytes, at).map(|(s, end)| (BencodeValue::String(s), end)),
        b'i' => decode_integer(bytes, at).map(|(i, end)| (BencodeValue::Integer(i), end)),
        b'l' => decode_list(bytes, at).map(|(l, end)| (BencodeValue::List(l), end)),
        b'd' => decode_dict(bytes, at).map(|(d, end)| (BencodeValue::Dict(d), end)),
        other => Err(BencodeError::InvalidFormat(format!(
            "Unexpected character: {}",
            other as char
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encoder;

    fn decode_ok(input: &[u8]) -> (BencodeValue, usize) {
        decode(input).expect("input should decode")
    }

    #[test]
    fn decodes_integers() {
        assert_eq!(decode_ok(b"i123e"), (BencodeValue::Integer(123), 5));
        assert_eq!(decode_ok(b"i-123e"), (BencodeValue::Integer(-123), 6));
        assert_eq!(decode_ok(b"i0e"), (BencodeValue::Integer(0), 3));
    }

    #[test]
    fn rejects_malformed_integers() {
        assert!(matches!(
            decode(b"i1234"),
            Err(BencodeError::UnexpectedEof)
        ));
        assert!(matches!(decode(b"i12b3e"), Err(BencodeError::InvalidInteger)));
        assert!(matches!(decode(b"ie"), Err(BencodeError::InvalidInteger)));
        assert!(matches!(decode(b"i03e"), Err(BencodeError::InvalidInteger)));
        assert!(matches!(decode(b"i1-23e"), Err(BencodeError::InvalidInteger)));
    }

    #[test]
    fn rejects_negative_zero() {
        // strict bencode: -0 is not a valid integer
        assert!(matches!(decode(b"i-0e"), Err(BencodeError::InvalidInteger)));
    }

    #[test]
    fn decodes_strings_as_raw_bytes() {
        assert_eq!(
            decode_ok(b"5:hello"),
            (BencodeValue::String(b"hello".to_vec()), 7)
        );
        assert_eq!(decode_ok(b"0:"), (BencodeValue::String(Vec::new()), 2));
        assert_eq!(
            decode_ok(b"3:\xff\x00\x01"),
            (BencodeValue::String(vec![0xff, 0x00, 0x01]), 5)
        );
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!(matches!(decode(b"4:abc"), Err(BencodeError::UnexpectedEof)));
        assert!(matches!(
            decode(b":abc"),
            Err(BencodeError::InvalidFormat(_))
        ));
        // a negative length can only be reached where a string is
        // mandatory, e.g. in dictionary-key position
        assert!(matches!(
            decode(b"d-1:xe"),
            Err(BencodeError::InvalidStringLength)
        ));
    }

    #[test]
    fn decodes_lists() {
        assert_eq!(
            decode_ok(b"li123ee"),
            (BencodeValue::List(vec![BencodeValue::Integer(123)]), 7)
        );
        assert_eq!(
            decode_ok(b"li123eli23ei13ee4:abc!e"),
            (
                BencodeValue::List(vec![
                    BencodeValue::Integer(123),
                    BencodeValue::List(vec![
                        BencodeValue::Integer(23),
                        BencodeValue::Integer(13),
                    ]),
                    BencodeValue::String(b"abc!".to_vec()),
                ]),
                23
            )
        );
        assert!(matches!(
            decode(b"li123e"),
            Err(BencodeError::UnexpectedEof)
        ));
    }

    #[test]
    fn decodes_dicts_with_non_string_key_rejected() {
        assert!(matches!(
            decode(b"di12ei23ee"),
            Err(BencodeError::InvalidStringLength)
        ));
    }

    #[test]
    fn reports_consumed_bytes_with_trailing_data() {
        let (value, consumed) = decode_ok(b"i123eXYZ");
        assert_eq!(value, BencodeValue::Integer(123));
        assert_eq!(consumed, 5);
    }

    #[test]
    fn nested_dict_round_trips_byte_exact() {
        // {"a": 123, "b": [1, 2]}
        let input: &[u8] = b"d1:ai123e1:bli1ei2eee";
        let (value, consumed) = decode_ok(input);
        assert_eq!(consumed, input.len());

        match &value {
            BencodeValue::Dict(dict) => {
                assert_eq!(dict.get(b"a".as_slice()), Some(&BencodeValue::Integer(123)));
                assert_eq!(
                    dict.get(b"b".as_slice()),
                    Some(&BencodeValue::List(vec![
                        BencodeValue::Integer(1),
                        BencodeValue::Integer(2),
                    ]))
                );
            }
            other => panic!("expected dict, got {other:?}"),
        }

        let mut reencoded = Vec::new();
        encoder::encode(&mut reencoded, &value).unwrap();
        assert_eq!(reencoded, input);
    }

    #[test]
    fn unsorted_wire_dict_reencodes_canonically() {
        let (value, _) = decode_ok(b"d1:b1:y1:a1:xe");
        let mut reencoded = Vec::new();
        encoder::encode(&mut reencoded, &value).unwrap();
        assert_eq!(reencoded, b"d1:a1:x1:b1:ye");
    }
}

use super::*;
use bytes::Bytes;
use std::collections::BTreeMap;

#[test]
fn test_decode_integer() {
    assert_eq!(decode(b"i42e").unwrap().as_int(), Some(42));
    assert_eq!(decode(b"i-7e").unwrap().as_int(), Some(-7));
    assert_eq!(decode(b"i0e").unwrap().as_int(), Some(0));
}

#[test]
fn test_decode_integer_rejects_noncanonical() {
    assert_eq!(decode(b"i007e"), Err(BencodeError::BadInteger));
    assert_eq!(decode(b"i-0e"), Err(BencodeError::BadInteger));
    assert_eq!(decode(b"ie"), Err(BencodeError::BadInteger));
    assert_eq!(decode(b"i42"), Err(BencodeError::Truncated));
}

#[test]
fn test_decode_string() {
    let v = decode(b"4:spam").unwrap();
    assert_eq!(v.as_str(), Some("spam"));

    let v = decode(b"0:").unwrap();
    assert_eq!(v.as_bytes().map(|b| b.len()), Some(0));
}

#[test]
fn test_decode_string_truncated() {
    assert_eq!(decode(b"10:short"), Err(BencodeError::Truncated));
    assert_eq!(decode(b"4spam"), Err(BencodeError::Truncated));
}

#[test]
fn test_decode_list() {
    let v = decode(b"li1ei2e4:spame").unwrap();
    let list = v.as_list().unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list[0].as_int(), Some(1));
    assert_eq!(list[2].as_str(), Some("spam"));
}

#[test]
fn test_decode_dict() {
    let v = decode(b"d3:bar4:spam3:fooi42ee").unwrap();
    assert_eq!(v.get_str(b"bar"), Some("spam"));
    assert_eq!(v.get_int(b"foo"), Some(42));
    assert!(v.get(b"missing").is_none());
}

#[test]
fn test_decode_dict_rejects_integer_key() {
    assert_eq!(decode(b"di1ei2ee"), Err(BencodeError::NonStringKey));
}

#[test]
fn test_trailing_data_rejected() {
    assert_eq!(decode(b"i42eextra"), Err(BencodeError::TrailingData));
}

#[test]
fn test_decode_prefix_reports_consumed() {
    let (v, used) = decode_prefix(b"d1:ai1eeRAWDATA").unwrap();
    assert_eq!(v.get_int(b"a"), Some(1));
    assert_eq!(used, 8);
}

#[test]
fn test_depth_limit() {
    let mut deep = Vec::new();
    deep.extend(std::iter::repeat(b'l').take(100));
    deep.extend(std::iter::repeat(b'e').take(100));
    assert_eq!(decode(&deep), Err(BencodeError::TooDeep));
}

#[test]
fn test_canonical_roundtrip() {
    let fixtures: &[&[u8]] = &[
        b"i42e",
        b"4:spam",
        b"le",
        b"de",
        b"li1ei2ei3ee",
        b"d3:bar4:spam3:fooi42ee",
        b"d4:infod6:lengthi16384e4:name4:test12:piece lengthi16384eee",
        b"d1:ad1:bl1:c1:deee",
    ];

    for fixture in fixtures {
        let value = decode(fixture).unwrap();
        assert_eq!(encode(&value), *fixture, "roundtrip mismatch");
    }
}

#[test]
fn test_encode_sorts_dict_keys() {
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"zz"), Value::Int(1));
    dict.insert(Bytes::from_static(b"aa"), Value::Int(2));
    let encoded = encode(&Value::Dict(dict));
    assert_eq!(encoded, b"d2:aai2e2:zzi1ee");
}

#[test]
fn test_binary_strings_survive() {
    let raw: Vec<u8> = (0..=255u8).collect();
    let mut input = Vec::new();
    input.extend_from_slice(b"256:");
    input.extend_from_slice(&raw);

    let value = decode(&input).unwrap();
    assert_eq!(value.as_bytes().unwrap().as_ref(), raw.as_slice());
    assert_eq!(encode(&value), input);
}

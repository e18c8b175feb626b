use super::*;
use crate::bencode::{encode, Value};
use bytes::Bytes;
use std::collections::BTreeMap;

fn info_dict(name: &str, piece_length: i64, piece_count: usize, length: i64) -> Value {
    let mut info = BTreeMap::new();
    info.insert(Bytes::from_static(b"name"), Value::str(name));
    info.insert(
        Bytes::from_static(b"piece length"),
        Value::Int(piece_length),
    );
    info.insert(
        Bytes::from_static(b"pieces"),
        Value::Bytes(Bytes::from(vec![0xAB; piece_count * 20])),
    );
    info.insert(Bytes::from_static(b"length"), Value::Int(length));
    Value::Dict(info)
}

fn torrent_bytes(info: Value) -> Vec<u8> {
    let mut root = BTreeMap::new();
    root.insert(
        Bytes::from_static(b"announce"),
        Value::str("http://tracker.example.com/announce"),
    );
    root.insert(Bytes::from_static(b"info"), info);
    encode(&Value::Dict(root))
}

#[test]
fn test_single_file_torrent() {
    let data = torrent_bytes(info_dict("file.bin", 16384, 2, 32768));
    let metainfo = Metainfo::from_bytes(&data).unwrap();

    assert_eq!(metainfo.info.name, "file.bin");
    assert_eq!(metainfo.info.piece_length, 16384);
    assert_eq!(metainfo.info.piece_count(), 2);
    assert_eq!(metainfo.info.total_length, 32768);
    assert_eq!(metainfo.info.files.len(), 1);
    assert_eq!(metainfo.info.files[0].length, 32768);
    assert_eq!(
        metainfo.announce.as_deref(),
        Some("http://tracker.example.com/announce")
    );
}

#[test]
fn test_short_last_piece() {
    // 40000 bytes at 16384 per piece: pieces of 16384, 16384, 7232.
    let data = torrent_bytes(info_dict("file.bin", 16384, 3, 40000));
    let metainfo = Metainfo::from_bytes(&data).unwrap();

    assert_eq!(metainfo.info.piece_size(0), 16384);
    assert_eq!(metainfo.info.piece_size(1), 16384);
    assert_eq!(metainfo.info.piece_size(2), 7232);
}

#[test]
fn test_piece_count_mismatch_rejected() {
    // 3 hashes for 2 pieces of content.
    let data = torrent_bytes(info_dict("file.bin", 16384, 3, 32768));
    assert!(Metainfo::from_bytes(&data).is_err());
}

#[test]
fn test_multi_file_torrent() {
    let mut info = BTreeMap::new();
    info.insert(Bytes::from_static(b"name"), Value::str("dir"));
    info.insert(Bytes::from_static(b"piece length"), Value::Int(16384));
    info.insert(
        Bytes::from_static(b"pieces"),
        Value::Bytes(Bytes::from(vec![0u8; 2 * 20])),
    );

    let file = |len: i64, name: &str| {
        let mut d = BTreeMap::new();
        d.insert(Bytes::from_static(b"length"), Value::Int(len));
        d.insert(
            Bytes::from_static(b"path"),
            Value::List(vec![Value::str(name)]),
        );
        Value::Dict(d)
    };
    info.insert(
        Bytes::from_static(b"files"),
        Value::List(vec![file(20000, "a.bin"), file(10000, "b.bin")]),
    );

    let data = torrent_bytes(Value::Dict(info));
    let metainfo = Metainfo::from_bytes(&data).unwrap();

    assert_eq!(metainfo.info.total_length, 30000);
    assert_eq!(metainfo.info.files.len(), 2);
    assert_eq!(metainfo.info.files[0].offset, 0);
    assert_eq!(metainfo.info.files[1].offset, 20000);
    let sum: u64 = metainfo.info.files.iter().map(|f| f.length).sum();
    assert_eq!(sum, metainfo.info.total_length);
}

#[test]
fn test_info_hash_matches_raw_info() {
    let info = info_dict("file.bin", 16384, 1, 16384);
    let raw = encode(&info);
    let data = torrent_bytes(info);

    let metainfo = Metainfo::from_bytes(&data).unwrap();
    assert_eq!(metainfo.info.info_hash, InfoHash::of_info(&raw));
    assert_eq!(metainfo.info.raw_info.as_ref(), raw.as_slice());
}

#[test]
fn test_from_info_bytes_roundtrip() {
    let raw = Bytes::from(encode(&info_dict("file.bin", 16384, 2, 32768)));
    let info = TorrentInfo::from_info_bytes(raw.clone()).unwrap();
    assert_eq!(info.info_hash, InfoHash::of_info(&raw));
    assert_eq!(info.piece_count(), 2);
}

#[test]
fn test_magnet_parse_hex() {
    let magnet = MagnetLink::parse(
        "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a\
         &dn=Example+Name&tr=http%3A%2F%2Ftracker.example.com%2Fannounce",
    )
    .unwrap();

    assert_eq!(
        magnet.info_hash.to_hex(),
        "c12fe1c06bba254a9dc9f519b335aa7c1367a88a"
    );
    assert_eq!(magnet.display_name.as_deref(), Some("Example Name"));
    assert_eq!(
        magnet.trackers,
        vec!["http://tracker.example.com/announce".to_string()]
    );
}

#[test]
fn test_magnet_missing_xt_rejected() {
    assert!(MagnetLink::parse("magnet:?dn=NoHash").is_err());
    assert!(MagnetLink::parse("http://example.com").is_err());
}

#[test]
fn test_info_hash_hex_roundtrip() {
    let hash = InfoHash([0x5A; 20]);
    let parsed = InfoHash::from_hex(&hash.to_hex()).unwrap();
    assert_eq!(hash, parsed);
}

#[test]
fn test_info_hash_base32() {
    // 20 bytes of zeros in base32 is 32 'A' characters.
    let hash = InfoHash::from_base32("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
    assert_eq!(hash.0, [0u8; 20]);
}

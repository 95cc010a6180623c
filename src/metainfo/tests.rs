use super::*;
use crate::bencode::{encode, Value};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

fn dict(entries: Vec<(&str, Value)>) -> Value {
    let map: BTreeMap<Bytes, Value> = entries
        .into_iter()
        .map(|(k, v)| (Bytes::copy_from_slice(k.as_bytes()), v))
        .collect();
    Value::Dict(map)
}

fn piece_hashes(count: usize) -> Value {
    let mut raw = Vec::with_capacity(count * 20);
    for i in 0..count {
        raw.extend_from_slice(&[i as u8; 20]);
    }
    Value::Bytes(Bytes::from(raw))
}

fn single_file_torrent() -> Vec<u8> {
    let info = dict(vec![
        ("length", Value::Int(96)),
        ("name", Value::text("test.bin")),
        ("piece length", Value::Int(32)),
        ("pieces", piece_hashes(3)),
    ]);
    let root = dict(vec![
        ("announce", Value::text("http://tracker.test/announce")),
        ("info", info),
    ]);
    encode(&root)
}

#[test]
fn parse_single_file() {
    let meta = Metainfo::from_bytes(&single_file_torrent()).unwrap();

    assert_eq!(meta.info.name, "test.bin");
    assert_eq!(meta.info.piece_length, 32);
    assert_eq!(meta.info.total_length, 96);
    assert_eq!(meta.info.piece_count(), 3);
    assert_eq!(meta.info.files.len(), 1);
    assert_eq!(meta.info.files[0].path.to_str(), Some("test.bin"));
    assert_eq!(
        meta.announce.as_deref(),
        Some("http://tracker.test/announce")
    );
}

#[test]
fn info_hash_matches_manual_sha1() {
    let info = dict(vec![
        ("length", Value::Int(96)),
        ("name", Value::text("test.bin")),
        ("piece length", Value::Int(32)),
        ("pieces", piece_hashes(3)),
    ]);
    let info_bytes = encode(&info);

    let mut hasher = Sha1::new();
    hasher.update(&info_bytes);
    let expected: [u8; 20] = hasher.finalize().into();

    let meta = Metainfo::from_bytes(&single_file_torrent()).unwrap();
    assert_eq!(meta.info_hash.as_bytes(), &expected);
}

#[test]
fn parse_multi_file() {
    let files = Value::List(vec![
        dict(vec![
            ("length", Value::Int(40)),
            ("path", Value::List(vec![Value::text("a.txt")])),
        ]),
        dict(vec![
            ("length", Value::Int(56)),
            (
                "path",
                Value::List(vec![Value::text("sub"), Value::text("b.txt")]),
            ),
        ]),
    ]);
    let info = dict(vec![
        ("files", files),
        ("name", Value::text("bundle")),
        ("piece length", Value::Int(32)),
        ("pieces", piece_hashes(3)),
    ]);
    let root = dict(vec![
        ("announce", Value::text("http://tracker.test/announce")),
        ("info", info),
    ]);

    let meta = Metainfo::from_bytes(&encode(&root)).unwrap();
    assert_eq!(meta.info.total_length, 96);
    assert_eq!(meta.info.files.len(), 2);
    assert_eq!(meta.info.files[0].offset, 0);
    assert_eq!(meta.info.files[1].offset, 40);
    assert_eq!(
        meta.info.files[1].path,
        std::path::PathBuf::from("bundle/sub/b.txt")
    );
}

#[test]
fn short_final_piece_size() {
    let info = dict(vec![
        ("length", Value::Int(70)),
        ("name", Value::text("odd.bin")),
        ("piece length", Value::Int(32)),
        ("pieces", piece_hashes(3)),
    ]);
    let root = dict(vec![("announce", Value::text("x")), ("info", info)]);

    let meta = Metainfo::from_bytes(&encode(&root)).unwrap();
    assert_eq!(meta.info.piece_size(0), 32);
    assert_eq!(meta.info.piece_size(1), 32);
    assert_eq!(meta.info.piece_size(2), 6);
}

#[test]
fn tracker_list_flattens_and_dedupes() {
    let tiers = Value::List(vec![
        Value::List(vec![
            Value::text("http://a/announce"),
            Value::text("http://b/announce"),
        ]),
        Value::List(vec![Value::text("http://a/announce")]),
    ]);
    let info = dict(vec![
        ("length", Value::Int(32)),
        ("name", Value::text("t")),
        ("piece length", Value::Int(32)),
        ("pieces", piece_hashes(1)),
    ]);
    let root = dict(vec![
        ("announce", Value::text("http://a/announce")),
        ("announce-list", tiers),
        ("info", info),
    ]);

    let meta = Metainfo::from_bytes(&encode(&root)).unwrap();
    assert_eq!(
        meta.trackers(),
        vec![
            "http://a/announce".to_string(),
            "http://b/announce".to_string()
        ]
    );
}

#[test]
fn rejects_bad_piece_table() {
    // 2 hashes for a 96-byte payload with 32-byte pieces (needs 3).
    let info = dict(vec![
        ("length", Value::Int(96)),
        ("name", Value::text("test.bin")),
        ("piece length", Value::Int(32)),
        ("pieces", piece_hashes(2)),
    ]);
    let root = dict(vec![("announce", Value::text("x")), ("info", info)]);
    assert!(Metainfo::from_bytes(&encode(&root)).is_err());
}

#[test]
fn rejects_missing_info() {
    let root = dict(vec![("announce", Value::text("x"))]);
    assert!(matches!(
        Metainfo::from_bytes(&encode(&root)),
        Err(MetainfoError::MissingField("info"))
    ));
}

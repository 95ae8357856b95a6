use std::sync::Arc;

use burrowdb::tree::ValueCondition;
use burrowdb::{Database, DurabilityMode};
use tempfile::tempdir;

fn open_db(dir: &std::path::Path, page_size: usize) -> Arc<Database> {
    Database::builder()
        .path(dir.join("test.burrow"))
        .page_size(page_size)
        .cache_size(64)
        .durability(DurabilityMode::NoSync)
        .open()
        .unwrap()
}

#[test]
fn ordered_iteration_over_three_entries() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    let tree = db.tree();

    let mut cursor = tree.cursor(None);
    cursor.find_and_store(b"a", Some(b"1")).unwrap();
    cursor.find_and_store(b"b", Some(b"2")).unwrap();
    cursor.find_and_store(b"c", Some(b"3")).unwrap();

    cursor.first().unwrap();
    assert_eq!(cursor.key(), Some(b"a" as &[u8]));
    assert_eq!(cursor.value(), Some(b"1" as &[u8]));

    cursor.next().unwrap();
    assert_eq!(cursor.key(), Some(b"b" as &[u8]));
    assert_eq!(cursor.value(), Some(b"2" as &[u8]));

    cursor.next().unwrap();
    assert_eq!(cursor.key(), Some(b"c" as &[u8]));

    cursor.next().unwrap();
    assert!(cursor.key().is_none(), "cursor should be unpositioned");
}

#[test]
fn reverse_iteration_from_last() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    let tree = db.tree();

    let mut cursor = tree.cursor(None);
    for i in 0..20u32 {
        let key = format!("key{:04}", i);
        cursor
            .find_and_store(key.as_bytes(), Some(b"v"))
            .unwrap();
    }

    cursor.last().unwrap();
    let mut seen = Vec::new();
    while let Some(key) = cursor.key() {
        seen.push(key.to_vec());
        cursor.previous().unwrap();
    }
    assert_eq!(seen.len(), 20);
    for window in seen.windows(2) {
        assert!(window[0] > window[1], "keys must strictly decrease");
    }
}

#[test]
fn find_and_modify_insert_precondition() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    let tree = db.tree();

    let mut cursor = tree.cursor(None);
    let first = cursor
        .find_and_modify(b"k", ValueCondition::Insert, Some(b"v1"))
        .unwrap();
    assert!(first, "first insert must succeed");

    let second = cursor
        .find_and_modify(b"k", ValueCondition::Insert, Some(b"v2"))
        .unwrap();
    assert!(!second, "second insert must observe the existing value");

    cursor.find(b"k").unwrap();
    assert_eq!(cursor.value(), Some(b"v1" as &[u8]));
}

#[test]
fn find_and_modify_replace_and_equals() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    let tree = db.tree();

    let mut cursor = tree.cursor(None);
    assert!(!cursor
        .find_and_modify(b"k", ValueCondition::Replace, Some(b"x"))
        .unwrap());

    cursor.find_and_store(b"k", Some(b"v1")).unwrap();
    assert!(cursor
        .find_and_modify(b"k", ValueCondition::Replace, Some(b"v2"))
        .unwrap());

    assert!(!cursor
        .find_and_modify(
            b"k",
            ValueCondition::Equals(Some(b"wrong".to_vec())),
            Some(b"v3")
        )
        .unwrap());
    assert!(cursor
        .find_and_modify(
            b"k",
            ValueCondition::Equals(Some(b"v2".to_vec())),
            None
        )
        .unwrap());

    cursor.find(b"k").unwrap();
    assert_eq!(cursor.value(), None);
}

#[test]
fn skip_with_limit_keys() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    let tree = db.tree();

    let mut cursor = tree.cursor(None);
    for b in b'a'..=b'z' {
        cursor.find_and_store(&[b], Some(b"v")).unwrap();
    }

    cursor.find(b"a").unwrap();
    cursor.skip_limit(5, Some(b"m"), false).unwrap();
    assert_eq!(cursor.key(), Some(b"f" as &[u8]));

    cursor.find(b"a").unwrap();
    let result = cursor.skip_limit(100, Some(b"m"), false).unwrap();
    assert!(!result.is_held());
    assert!(cursor.key().is_none(), "limit abort must reset the cursor");
}

#[test]
fn skip_round_trip_returns_to_origin() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    let tree = db.tree();

    let mut cursor = tree.cursor(None);
    for i in 0..200u32 {
        let key = format!("key{:04}", i);
        cursor.find_and_store(key.as_bytes(), Some(b"v")).unwrap();
    }

    cursor.find(b"key0050").unwrap();
    cursor.skip(87).unwrap();
    assert_eq!(cursor.key(), Some(b"key0137".as_ref()));
    cursor.skip(-87).unwrap();
    assert_eq!(cursor.key(), Some(b"key0050".as_ref()));
}

#[test]
fn find_variants_position_around_probes() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    let tree = db.tree();

    let mut cursor = tree.cursor(None);
    for key in [b"b" as &[u8], b"d", b"f"] {
        cursor.find_and_store(key, Some(b"v")).unwrap();
    }

    cursor.find_ge(b"c").unwrap();
    assert_eq!(cursor.key(), Some(b"d" as &[u8]));
    cursor.find_ge(b"d").unwrap();
    assert_eq!(cursor.key(), Some(b"d" as &[u8]));
    cursor.find_gt(b"d").unwrap();
    assert_eq!(cursor.key(), Some(b"f" as &[u8]));
    cursor.find_le(b"c").unwrap();
    assert_eq!(cursor.key(), Some(b"b" as &[u8]));
    cursor.find_lt(b"b").unwrap();
    assert!(cursor.key().is_none());
}

#[test]
fn find_nearby_tracks_local_movement() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 1024);
    let tree = db.tree();

    let mut cursor = tree.cursor(None);
    for i in 0..500u32 {
        let key = format!("key{:05}", i);
        cursor.find_and_store(key.as_bytes(), Some(b"v")).unwrap();
    }

    cursor.find(b"key00100").unwrap();
    cursor.find_nearby(b"key00101").unwrap();
    assert_eq!(cursor.value(), Some(b"v" as &[u8]));

    // A far key forces a pop to an upper level.
    cursor.find_nearby(b"key00400").unwrap();
    assert_eq!(cursor.value(), Some(b"v" as &[u8]));

    // Missing nearby key positions on the complement.
    cursor.find_nearby(b"key00400x").unwrap();
    assert_eq!(cursor.value(), None);
    cursor.next().unwrap();
    assert_eq!(cursor.key(), Some(b"key00401".as_ref()));
}

#[test]
fn random_skips_ghost_free_range() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    let tree = db.tree();

    let mut cursor = tree.cursor(None);
    for i in 0..100u32 {
        let key = format!("key{:04}", i);
        cursor.find_and_store(key.as_bytes(), Some(b"v")).unwrap();
    }

    for _ in 0..20 {
        let result = cursor
            .random(Some(b"key0010"), Some(b"key0050"))
            .unwrap();
        let _ = result;
        let key = cursor.key().expect("range is not empty");
        assert!(key >= b"key0010" as &[u8] && key < b"key0050" as &[u8]);
        assert_eq!(cursor.value(), Some(b"v" as &[u8]));
    }

    // Empty range resets the cursor.
    cursor.random(Some(b"zz"), None).unwrap();
    assert!(cursor.key().is_none());
}

#[test]
fn autoload_off_reports_not_loaded() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    let tree = db.tree();

    let mut cursor = tree.cursor(None);
    cursor.find_and_store(b"k", Some(b"v")).unwrap();

    cursor.autoload(false);
    cursor.find(b"k").unwrap();
    assert_eq!(cursor.value(), None);
    assert!(matches!(
        cursor.value_state(),
        burrowdb::tree::CursorValue::NotLoaded
    ));

    cursor.autoload(true);
    cursor.load().unwrap();
    assert_eq!(cursor.value(), Some(b"v" as &[u8]));
}

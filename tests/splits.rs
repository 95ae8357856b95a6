use std::sync::Arc;

use burrowdb::tree::tree::CollectingVerifyObserver;
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
fn hundred_byte_values_force_splits_and_stay_ordered() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    let tree = db.tree();

    // Two 100-byte values fill a 256-byte page, so a handful of inserts
    // forces multiple leaf splits and a root split.
    let value = [0x42u8; 100];
    let mut cursor = tree.cursor(None);
    for i in 0..12u32 {
        let key = format!("key{:03}", i);
        cursor.find_and_store(key.as_bytes(), Some(&value)).unwrap();
    }
    assert!(tree.height().unwrap() > 1, "splits must have happened");

    for i in 0..12u32 {
        let key = format!("key{:03}", i);
        cursor.find(key.as_bytes()).unwrap();
        assert_eq!(cursor.value(), Some(&value[..]), "key {} lost", key);
    }

    cursor.first().unwrap();
    let mut seen = Vec::new();
    while let Some(key) = cursor.key() {
        seen.push(key.to_vec());
        cursor.next().unwrap();
    }
    assert_eq!(seen.len(), 12);
    for window in seen.windows(2) {
        assert!(window[0] < window[1]);
    }

    let mut observer = CollectingVerifyObserver::default();
    assert!(tree.verify(&mut observer).unwrap());
    assert!(
        observer.failures.is_empty(),
        "verify failures: {:?}",
        observer.failures
    );
}

#[test]
fn interleaved_inserts_survive_many_splits() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    let tree = db.tree();

    let mut cursor = tree.cursor(None);
    // Insert in a shuffled-ish order to exercise both split directions.
    for i in (0..400u32).rev().step_by(2) {
        let key = format!("key{:05}", i);
        let value = format!("value{:05}", i);
        cursor
            .find_and_store(key.as_bytes(), Some(value.as_bytes()))
            .unwrap();
    }
    for i in (1..400u32).step_by(2) {
        let key = format!("key{:05}", i);
        let value = format!("value{:05}", i);
        cursor
            .find_and_store(key.as_bytes(), Some(value.as_bytes()))
            .unwrap();
    }

    for i in 0..400u32 {
        let key = format!("key{:05}", i);
        let expected = format!("value{:05}", i);
        cursor.find(key.as_bytes()).unwrap();
        assert_eq!(cursor.value(), Some(expected.as_bytes()), "key {}", key);
    }

    let mut observer = CollectingVerifyObserver::default();
    assert!(tree.verify(&mut observer).unwrap());
    assert!(observer.failures.is_empty());
}

#[test]
fn deletes_merge_nodes_back_down() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    let tree = db.tree();

    let mut cursor = tree.cursor(None);
    for i in 0..300u32 {
        let key = format!("key{:05}", i);
        cursor
            .find_and_store(key.as_bytes(), Some(b"some-filler-value"))
            .unwrap();
    }
    let grown_height = tree.height().unwrap();
    assert!(grown_height > 1);

    for i in 0..300u32 {
        if i % 10 != 0 {
            let key = format!("key{:05}", i);
            cursor.find_and_store(key.as_bytes(), None).unwrap();
        }
    }

    // Every tenth key survives, in order.
    cursor.first().unwrap();
    let mut expected = 0u32;
    while let Some(key) = cursor.key() {
        assert_eq!(key, format!("key{:05}", expected).as_bytes());
        expected += 10;
        cursor.next().unwrap();
    }
    assert_eq!(expected, 300);

    let mut observer = CollectingVerifyObserver::default();
    assert!(tree.verify(&mut observer).unwrap());
    assert!(observer.failures.is_empty());
}

#[test]
fn large_values_fragment_and_round_trip() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    let tree = db.tree();

    let big = (0..5000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
    let mut cursor = tree.cursor(None);
    cursor.find_and_store(b"big", Some(&big)).unwrap();
    cursor.find_and_store(b"small", Some(b"s")).unwrap();

    cursor.find(b"big").unwrap();
    assert_eq!(cursor.value(), Some(&big[..]));
    cursor.find(b"small").unwrap();
    assert_eq!(cursor.value(), Some(b"s" as &[u8]));

    // Overwrite frees the old chain and fragments the new value.
    let bigger = vec![7u8; 8000];
    cursor.find_and_store(b"big", Some(&bigger)).unwrap();
    cursor.find(b"big").unwrap();
    assert_eq!(cursor.value(), Some(&bigger[..]));

    cursor.find_and_store(b"big", None).unwrap();
    cursor.find(b"big").unwrap();
    assert_eq!(cursor.value(), None);
}

#[test]
fn delete_all_leaves_an_empty_tree() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    let tree = db.tree();

    let mut cursor = tree.cursor(None);
    for i in 0..250u32 {
        let key = format!("key{:05}", i);
        cursor
            .find_and_store(key.as_bytes(), Some(b"payload-payload"))
            .unwrap();
    }
    assert!(tree.height().unwrap() > 1);

    let mut clearer = tree.cursor(None);
    clearer.delete_all().unwrap();

    let mut check = tree.cursor(None);
    check.first().unwrap();
    assert!(check.key().is_none(), "tree must be empty");
    assert_eq!(tree.height().unwrap(), 1, "tree must collapse to a leaf root");

    // The tree remains usable.
    check.find_and_store(b"again", Some(b"yes")).unwrap();
    check.find(b"again").unwrap();
    assert_eq!(check.value(), Some(b"yes" as &[u8]));
}

#[test]
fn compact_migrates_pages_down() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    let tree = db.tree();

    let mut cursor = tree.cursor(None);
    for i in 0..200u32 {
        let key = format!("key{:05}", i);
        cursor
            .find_and_store(key.as_bytes(), Some(b"fill-fill-fill"))
            .unwrap();
    }
    // Delete the upper half and checkpoint so the freed low ids become
    // allocatable.
    for i in 100..200u32 {
        let key = format!("key{:05}", i);
        cursor.find_and_store(key.as_bytes(), None).unwrap();
    }
    db.checkpoint().unwrap();

    struct Counter(usize);
    impl burrowdb::tree::CompactionObserver for Counter {
        fn node_visited(&mut self, _id: u64) -> bool {
            self.0 += 1;
            true
        }
    }

    let mut compactor = tree.cursor(None);
    let mut observer = Counter(0);
    let threshold = 1_000_000;
    assert!(compactor.compact(threshold, &mut observer).unwrap());

    // Everything is already below a generous threshold, and the data
    // survives the scan.
    for i in 0..100u32 {
        let key = format!("key{:05}", i);
        cursor.find(key.as_bytes()).unwrap();
        assert_eq!(cursor.value(), Some(b"fill-fill-fill" as &[u8]));
    }
}

#[test]
fn verify_spots_nothing_on_a_healthy_tree() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 512);
    let tree = db.tree();

    let mut cursor = tree.cursor(None);
    for i in 0..1000u32 {
        let key = format!("key{:06}", i);
        cursor.find_and_store(key.as_bytes(), Some(b"v")).unwrap();
    }

    let mut observer = CollectingVerifyObserver::default();
    assert!(tree.verify(&mut observer).unwrap());
    assert!(observer.failures.is_empty());
}

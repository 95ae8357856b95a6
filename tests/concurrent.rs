use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use burrowdb::tree::tree::CollectingVerifyObserver;
use burrowdb::{Database, DurabilityMode};
use tempfile::tempdir;

fn open_db(dir: &std::path::Path, page_size: usize) -> Arc<Database> {
    Database::builder()
        .path(dir.join("test.burrow"))
        .page_size(page_size)
        .cache_size(128)
        .durability(DurabilityMode::NoSync)
        .open()
        .unwrap()
}

fn fill(db: &Database, count: u32) {
    let tree = db.tree();
    let mut cursor = tree.cursor(None);
    for i in 0..count {
        let key = format!("key{:06}", i);
        let value = format!("value{:06}", i);
        cursor
            .find_and_store(key.as_bytes(), Some(value.as_bytes()))
            .unwrap();
    }
}

#[test]
fn two_cursors_iterate_the_full_sequence() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 512);
    fill(&db, 1000);

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let db = Arc::clone(&db);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let tree = db.tree();
            let mut cursor = tree.cursor(None);
            barrier.wait();
            cursor.first().unwrap();
            let mut seen = Vec::new();
            while let Some(key) = cursor.key() {
                seen.push(key.to_vec());
                cursor.next().unwrap();
            }
            seen
        }));
    }

    for handle in handles {
        let seen = handle.join().unwrap();
        assert_eq!(seen.len(), 1000, "each cursor observes every entry");
        for window in seen.windows(2) {
            assert!(window[0] < window[1], "strictly increasing");
        }
    }
}

#[test]
fn concurrent_writers_in_disjoint_ranges() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 512);

    let mut handles = Vec::new();
    for range in 0..4u32 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            let tree = db.tree();
            let mut cursor = tree.cursor(None);
            for i in 0..250u32 {
                let key = format!("w{}key{:05}", range, i);
                let value = format!("w{}val{:05}", range, i);
                cursor
                    .find_and_store(key.as_bytes(), Some(value.as_bytes()))
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let tree = db.tree();
    let mut cursor = tree.cursor(None);
    cursor.first().unwrap();
    let mut count = 0;
    let mut prev: Option<Vec<u8>> = None;
    while let Some(key) = cursor.key() {
        if let Some(prev) = &prev {
            assert!(prev.as_slice() < key);
        }
        prev = Some(key.to_vec());
        count += 1;
        cursor.next().unwrap();
    }
    assert_eq!(count, 1000);

    let mut observer = CollectingVerifyObserver::default();
    assert!(tree.verify(&mut observer).unwrap());
    assert!(observer.failures.is_empty(), "{:?}", observer.failures);
}

#[test]
fn reverse_reader_survives_concurrent_deletes() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 512);
    fill(&db, 1000);

    let deleting = Arc::new(AtomicBool::new(true));
    let deleter = {
        let db = Arc::clone(&db);
        let deleting = Arc::clone(&deleting);
        thread::spawn(move || {
            let tree = db.tree();
            let mut cursor = tree.cursor(None);
            for i in (0..1000u32).step_by(2) {
                let key = format!("key{:06}", i);
                cursor.find_and_store(key.as_bytes(), None).unwrap();
            }
            deleting.store(false, Ordering::Release);
        })
    };

    let reader = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            let tree = db.tree();
            let mut observed: Vec<Vec<u8>> = Vec::new();
            let mut cursor = tree.cursor(None);
            cursor.last().unwrap();
            while let Some(key) = cursor.key() {
                observed.push(key.to_vec());
                cursor.previous().unwrap();
            }
            observed
        })
    };

    let observed = reader.join().unwrap();
    deleter.join().unwrap();

    // Monotonically decreasing, and every odd key (never deleted) that
    // the scan passed must have been observed.
    for window in observed.windows(2) {
        assert!(window[0] > window[1], "observed keys must decrease");
    }
    let odd_seen: Vec<&Vec<u8>> = observed
        .iter()
        .filter(|k| {
            let s = String::from_utf8_lossy(k);
            s.strip_prefix("key")
                .and_then(|n| n.parse::<u32>().ok())
                .map(|n| n % 2 == 1)
                .unwrap_or(false)
        })
        .collect();
    assert_eq!(odd_seen.len(), 500, "all surviving odd keys observed");

    // After both finish, exactly the odd keys remain.
    let tree = db.tree();
    let mut cursor = tree.cursor(None);
    cursor.first().unwrap();
    let mut remaining = 0;
    while let Some(key) = cursor.key() {
        let s = String::from_utf8_lossy(key);
        let n: u32 = s.strip_prefix("key").unwrap().parse().unwrap();
        assert_eq!(n % 2, 1, "only odd keys survive");
        remaining += 1;
        cursor.next().unwrap();
    }
    assert_eq!(remaining, 500);
}

#[test]
fn readers_run_against_a_splitting_tree() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 256);
    fill(&db, 100);

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let db = Arc::clone(&db);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let tree = db.tree();
            let mut cursor = tree.cursor(None);
            for i in 100..600u32 {
                let key = format!("key{:06}", i);
                cursor
                    .find_and_store(key.as_bytes(), Some(b"value-payload"))
                    .unwrap();
            }
            stop.store(true, Ordering::Release);
        })
    };

    let mut scans = 0;
    let tree = db.tree();
    while !stop.load(Ordering::Acquire) {
        let mut cursor = tree.cursor(None);
        cursor.first().unwrap();
        let mut prev: Option<Vec<u8>> = None;
        let mut count = 0;
        while let Some(key) = cursor.key() {
            if let Some(prev) = &prev {
                assert!(prev.as_slice() < key, "order holds mid-split");
            }
            prev = Some(key.to_vec());
            count += 1;
            cursor.next().unwrap();
        }
        assert!(count >= 100, "never fewer entries than the stable prefix");
        scans += 1;
    }
    writer.join().unwrap();
    assert!(scans > 0);

    let mut observer = CollectingVerifyObserver::default();
    assert!(tree.verify(&mut observer).unwrap());
    assert!(observer.failures.is_empty());
}

#[test]
fn repeatable_read_blocks_conflicting_writes() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), 512);
    fill(&db, 10);

    let txn = db.begin().unwrap();
    let tree = db.tree();
    {
        let mut cursor = tree.cursor(Some(Arc::clone(&txn)));
        cursor.find(b"key000003").unwrap();
        assert_eq!(cursor.value(), Some(b"value000003" as &[u8]));
    }

    // A concurrent writer cannot touch the locked key until commit.
    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            let tree = db.tree();
            let mut cursor = tree.cursor(None);
            cursor.find_and_store(b"key000003", Some(b"overwritten")).unwrap();
        })
    };

    thread::sleep(std::time::Duration::from_millis(100));
    {
        let mut cursor = tree.cursor(Some(Arc::clone(&txn)));
        cursor.find(b"key000003").unwrap();
        assert_eq!(
            cursor.value(),
            Some(b"value000003" as &[u8]),
            "repeatable read holds while the writer waits"
        );
    }
    txn.commit().unwrap();
    writer.join().unwrap();

    let mut cursor = tree.cursor(None);
    cursor.find(b"key000003").unwrap();
    assert_eq!(cursor.value(), Some(b"overwritten" as &[u8]));
}

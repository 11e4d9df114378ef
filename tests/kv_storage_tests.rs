//! Integration Tests for KV Storage
//!
//! Round-trips, self-healing, trims, and progress-reporting removal
//! against a real on-disk store.

use std::cell::Cell;
use std::fs;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use tempfile::TempDir;
use tiercache::{KvStorage, StorageMode};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn open(mode: StorageMode) -> (TempDir, KvStorage) {
    init_tracing();
    let dir = TempDir::new().expect("temp dir");
    let store = KvStorage::open(dir.path().join("store"), mode).expect("open");
    (dir, store)
}

fn data_path(dir: &TempDir, filename: &str) -> PathBuf {
    dir.path().join("store").join("data").join(filename)
}

// == Persistent Round-Trip ==

#[test]
fn test_external_roundtrip_with_extended_data() {
    let (dir, mut store) = open(StorageMode::Mixed);
    store
        .save_item("animal", b"cute kitten bytes", Some("animal"), Some(b"meta"))
        .unwrap();

    let item = store.get_item("animal").unwrap().expect("saved item");
    assert_eq!(item.value, Some(b"cute kitten bytes".to_vec()));
    assert_eq!(item.extended_data, Some(b"meta".to_vec()));
    assert!(store.item_exists("animal").unwrap());

    // The external file carries exactly the value bytes.
    let on_disk = fs::read(data_path(&dir, "animal")).unwrap();
    assert_eq!(on_disk, b"cute kitten bytes");
    assert_eq!(item.size, on_disk.len() as u64);
}

#[test]
fn test_inline_roundtrip_in_mixed_mode() {
    let (_dir, mut store) = open(StorageMode::Mixed);
    store.save_item("k", b"inline bytes", None, Some(b"x")).unwrap();

    let item = store.get_item("k").unwrap().expect("saved item");
    assert_eq!(item.value, Some(b"inline bytes".to_vec()));
    assert_eq!(item.filename, None);
    assert_eq!(item.extended_data, Some(b"x".to_vec()));
}

// == Missing File Heals ==

#[test]
fn test_out_of_band_file_loss_heals_manifest() {
    let (dir, mut store) = open(StorageMode::Mixed);
    store
        .save_item("animal", b"cute kitten bytes", Some("animal"), Some(b"meta"))
        .unwrap();

    fs::remove_file(data_path(&dir, "animal")).unwrap();

    assert!(store.get_item("animal").unwrap().is_none());
    assert!(!store.item_exists("animal").unwrap());
}

// == Manifest Consistency ==

#[test]
fn test_mixed_mode_rows_are_inline_or_external_never_both() {
    let (dir, mut store) = open(StorageMode::Mixed);
    for i in 0..10u32 {
        let key = format!("k{i}");
        if i % 2 == 0 {
            store
                .save_item(&key, format!("external {i}").as_bytes(), Some(&key), None)
                .unwrap();
        } else {
            store
                .save_item(&key, format!("inline {i}").as_bytes(), None, None)
                .unwrap();
        }
    }

    for i in 0..10u32 {
        let key = format!("k{i}");
        let info = store.get_item_info(&key).unwrap().expect("row");
        let item = store.get_item(&key).unwrap().expect("item");
        match info.filename {
            Some(name) => {
                // External rows: a real file of matching length, no
                // inline blob.
                let meta = fs::metadata(data_path(&dir, &name)).expect("backing file");
                assert_eq!(meta.len(), info.size);
                assert_eq!(name, key);
            }
            None => {
                assert_eq!(
                    item.value.as_ref().map(|v| v.len() as u64),
                    Some(info.size)
                );
            }
        }
    }
}

// == Size Trim ==

#[test]
fn test_remove_larger_than_keeps_small_items() {
    let (_dir, mut store) = open(StorageMode::Sqlite);
    for i in 1..=10u64 {
        let size = (i * 10) as usize;
        store
            .save_item(&format!("k{i}"), &vec![0u8; size], None, None)
            .unwrap();
    }

    store.remove_items_larger_than(50).unwrap();

    assert_eq!(store.items_count().unwrap(), 5);
    assert_eq!(store.items_size().unwrap(), 150);
    for i in 1..=5u64 {
        assert!(store.item_exists(&format!("k{i}")).unwrap());
    }
    for i in 6..=10u64 {
        assert!(!store.item_exists(&format!("k{i}")).unwrap());
    }
}

// == Progress Removal ==

#[test]
fn test_remove_all_with_progress_reports_and_terminates() {
    let (_dir, mut store) = open(StorageMode::Sqlite);
    for i in 0..50u32 {
        store
            .save_item(&format!("k{i}"), &[1u8; 8], None, None)
            .unwrap();
    }

    let mut reports: Vec<(u64, u64)> = Vec::new();
    let ended = Cell::new(None);
    store.remove_all_items_with_progress(
        |removed, total| reports.push((removed, total)),
        |errored| ended.set(Some(errored)),
    );

    assert_eq!(ended.get(), Some(false));
    assert!(!reports.is_empty());
    for window in reports.windows(2) {
        assert!(window[0].0 <= window[1].0);
    }
    for (_, total) in &reports {
        assert_eq!(*total, 50);
    }
    assert_eq!(reports.last(), Some(&(50, 50)));
    assert_eq!(store.items_count().unwrap(), 0);
}

#[test]
fn test_remove_all_with_progress_on_empty_store() {
    let (_dir, mut store) = open(StorageMode::Sqlite);

    let mut reports = 0usize;
    let ended = Cell::new(None);
    store.remove_all_items_with_progress(|_, _| reports += 1, |errored| ended.set(Some(errored)));

    assert_eq!(ended.get(), Some(false));
    assert_eq!(reports, 0);
}

// == Bounded Trims ==

#[test]
fn test_fit_count_keeps_most_recently_accessed() {
    let (_dir, mut store) = open(StorageMode::Sqlite);
    for i in 0..5u32 {
        store
            .save_item(&format!("old{i}"), &[0u8; 4], None, None)
            .unwrap();
    }
    // Land the second batch in a later access-time bucket.
    sleep(Duration::from_millis(1100));
    for i in 0..5u32 {
        store
            .save_item(&format!("new{i}"), &[0u8; 4], None, None)
            .unwrap();
    }

    store.remove_items_to_fit_count(5).unwrap();

    assert_eq!(store.items_count().unwrap(), 5);
    for i in 0..5u32 {
        assert!(store.item_exists(&format!("new{i}")).unwrap());
        assert!(!store.item_exists(&format!("old{i}")).unwrap());
    }
}

#[test]
fn test_fit_size_trims_oldest_first() {
    let (_dir, mut store) = open(StorageMode::Sqlite);
    for i in 0..4u32 {
        store
            .save_item(&format!("old{i}"), &[0u8; 100], None, None)
            .unwrap();
    }
    sleep(Duration::from_millis(1100));
    store.save_item("fresh", &[0u8; 100], None, None).unwrap();

    store.remove_items_to_fit_size(150).unwrap();

    assert!(store.items_size().unwrap() <= 150);
    assert!(store.item_exists("fresh").unwrap());
}

#[test]
fn test_fit_count_noop_when_under_bound() {
    let (_dir, mut store) = open(StorageMode::Sqlite);
    for i in 0..3u32 {
        store
            .save_item(&format!("k{i}"), &[0u8; 4], None, None)
            .unwrap();
    }

    store.remove_items_to_fit_count(10).unwrap();

    assert_eq!(store.items_count().unwrap(), 3);
}

// == Age Removal ==

#[test]
fn test_remove_earlier_than_past_timestamp_keeps_fresh_items() {
    let (_dir, mut store) = open(StorageMode::Sqlite);
    store.save_item("k", &[0u8; 4], None, None).unwrap();

    // A cutoff far in the past removes nothing.
    store.remove_items_earlier_than(1_000_000).unwrap();
    assert!(store.item_exists("k").unwrap());
}

#[test]
fn test_remove_earlier_than_cutoff_second_preserves_row() {
    let (_dir, mut store) = open(StorageMode::Sqlite);
    store.save_item("k", &[0u8; 4], None, None).unwrap();
    let accessed_at = store
        .get_item_info("k")
        .unwrap()
        .expect("row")
        .last_access_time;

    // The cutoff is strict: an item accessed in that very second stays.
    store.remove_items_earlier_than(accessed_at).unwrap();
    assert!(store.item_exists("k").unwrap());

    // One second past it, the item goes.
    store.remove_items_earlier_than(accessed_at + 1).unwrap();
    assert!(!store.item_exists("k").unwrap());
}

#[test]
fn test_remove_earlier_than_future_timestamp_clears() {
    let (_dir, mut store) = open(StorageMode::Mixed);
    store.save_item("a", &[0u8; 4], Some("a"), None).unwrap();
    store.save_item("b", &[0u8; 4], None, None).unwrap();

    store.remove_items_earlier_than(i64::MAX).unwrap();

    assert_eq!(store.items_count().unwrap(), 0);
    assert_eq!(store.items_size().unwrap(), 0);
}

// == Remove All ==

#[test]
fn test_remove_all_zeroes_count_and_size() {
    let (_dir, mut store) = open(StorageMode::Mixed);
    for i in 0..8u32 {
        let key = format!("k{i}");
        let filename = if i % 2 == 0 { Some(key.clone()) } else { None };
        store
            .save_item(&key, &[7u8; 16], filename.as_deref(), None)
            .unwrap();
    }

    store.remove_all_items().unwrap();

    assert_eq!(store.items_count().unwrap(), 0);
    assert_eq!(store.items_size().unwrap(), 0);
}

// == Multi-Key Fetch ==

#[test]
fn test_multi_key_fetch_returns_present_keys_only() {
    let (_dir, mut store) = open(StorageMode::Sqlite);
    store.save_item("a", b"aa", None, None).unwrap();
    store.save_item("b", b"bb", None, None).unwrap();

    let items = store.get_items_for_keys(&["a", "b", "missing"]).unwrap();
    let mut keys: Vec<_> = items.iter().map(|i| i.key.as_str()).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["a", "b"]);

    let infos = store.get_item_infos_for_keys(&["a", "b"]).unwrap();
    assert_eq!(infos.len(), 2);
    assert!(infos.iter().all(|i| i.value.is_none()));
}

// == Value Accessor ==

#[test]
fn test_get_item_value() {
    let (_dir, mut store) = open(StorageMode::Mixed);
    store.save_item("ext", b"on disk", Some("ext"), None).unwrap();
    store.save_item("inl", b"in row", None, None).unwrap();

    assert_eq!(store.get_item_value("ext").unwrap(), Some(b"on disk".to_vec()));
    assert_eq!(store.get_item_value("inl").unwrap(), Some(b"in row".to_vec()));
    assert_eq!(store.get_item_value("nope").unwrap(), None);
}

// == Trash Reclamation ==

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remove_all_purges_trash_in_background() {
    let dir = TempDir::new().expect("temp dir");
    let root = dir.path().join("store");
    let mut store = KvStorage::open(&root, StorageMode::Mixed).unwrap();
    store.save_item("k", b"payload", Some("blob"), None).unwrap();

    store.remove_all_items().unwrap();

    let trash = root.join("trash");
    for _ in 0..200 {
        if fs::read_dir(&trash).map(|e| e.count() == 0).unwrap_or(false) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fs::read_dir(&trash).unwrap().count(), 0);
}

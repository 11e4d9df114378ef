//! KV Storage Module
//!
//! Composes the file store, the manifest database, and the storage-mode
//! policy into one persistent key-value API.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::error::{CacheError, Result};
use crate::storage::file_store::FileStore;
use crate::storage::item::Item;
use crate::storage::metadata::{MetadataDb, TrimCandidate};

const DB_FILENAME: &str = "manifest.sqlite";
const DB_SHM_FILENAME: &str = "manifest.sqlite-shm";
const DB_WAL_FILENAME: &str = "manifest.sqlite-wal";

/// Linux PATH_MAX, minus headroom for the files the store creates
/// underneath the root.
const ROOT_PATH_LEN_MAX: usize = 4096 - 64;

/// Page size of the bounded LRU trims.
const TRIM_PAGE: usize = 16;
/// Page size of progress-reporting removal.
const PROGRESS_PAGE: usize = 32;

// == Storage Mode ==
/// Where values live on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Values are always external files; writes must carry a filename.
    File,
    /// Values are always inline manifest blobs.
    Sqlite,
    /// The caller chooses per write by supplying a filename or not.
    Mixed,
}

// == KV Storage ==
/// A persistent key-value store: a SQLite manifest plus a directory of
/// value files, with staged-trash space reclamation.
///
/// Not internally thread-safe; wrap it in a lock (or confine it to one
/// thread) when sharing. Values and extended data are opaque byte
/// sequences.
pub struct KvStorage {
    root: PathBuf,
    mode: StorageMode,
    files: FileStore,
    db: MetadataDb,
}

impl std::fmt::Debug for KvStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStorage")
            .field("root", &self.root)
            .field("mode", &self.mode)
            .finish()
    }
}

impl KvStorage {
    // == Constructor ==
    /// Opens (or creates) a store rooted at `root`.
    ///
    /// Creates `root/`, `root/data/`, and `root/trash/`, then opens the
    /// manifest database. If the database cannot be initialized the
    /// store performs one full reset (manifest files deleted, `data/`
    /// staged to trash, trash purged in background) and retries once.
    pub fn open(root: impl Into<PathBuf>, mode: StorageMode) -> Result<Self> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(CacheError::InvalidArgument("empty root path".to_string()));
        }
        if root.as_os_str().len() > ROOT_PATH_LEN_MAX {
            return Err(CacheError::InvalidArgument(format!(
                "root path exceeds {ROOT_PATH_LEN_MAX} bytes"
            )));
        }
        fs::create_dir_all(&root)?;
        let files = FileStore::new(&root)?;
        let mut db = MetadataDb::new(root.join(DB_FILENAME));
        if let Err(err) = db.ensure_open() {
            warn!(root = %root.display(), %err, "manifest unusable, performing full reset");
            db.close();
            delete_db_files(&root)?;
            files.move_all_to_trash()?;
            files.empty_trash_in_background();
            db.ensure_open()?;
        }
        info!(root = %root.display(), ?mode, "kv storage opened");
        Ok(Self {
            root,
            mode,
            files,
            db,
        })
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // == Save ==
    /// Persists one item.
    ///
    /// With a non-empty `filename` the bytes are written under `data/`
    /// and the manifest row references the file; a failed row commit
    /// rolls the file back. Without a filename the bytes are stored
    /// inline, replacing (and deleting) any previous external file for
    /// the key. In [`StorageMode::File`] a missing filename is
    /// rejected.
    pub fn save_item(
        &mut self,
        key: &str,
        value: &[u8],
        filename: Option<&str>,
        extended_data: Option<&[u8]>,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(CacheError::InvalidArgument("empty key".to_string()));
        }
        if value.is_empty() {
            return Err(CacheError::InvalidArgument("empty value".to_string()));
        }
        let filename = filename.filter(|name| !name.is_empty());
        if self.mode == StorageMode::File && filename.is_none() {
            return Err(CacheError::InvalidArgument(
                "file mode requires a filename".to_string(),
            ));
        }
        match filename {
            Some(name) => {
                self.files.write(name, value)?;
                if let Err(err) = self.db.upsert(
                    key,
                    Some(name),
                    value.len() as u64,
                    None,
                    extended_data,
                ) {
                    // Do not leave an unreferenced blob behind.
                    if let Err(cleanup) = self.files.delete(name) {
                        warn!(key, file = name, %cleanup, "rollback delete failed");
                    }
                    return Err(err);
                }
            }
            None => {
                if let Ok(Some(old)) = self.db.get_filename(key) {
                    if let Err(err) = self.files.delete(&old) {
                        debug!(key, file = %old, %err, "stale file delete failed");
                    }
                }
                self.db
                    .upsert(key, None, value.len() as u64, Some(value), extended_data)?;
            }
        }
        Ok(())
    }

    // == Get ==
    /// Fetches one item with its value bytes, refreshing its access
    /// time. A row whose backing file has vanished is pruned and
    /// reported as absent.
    pub fn get_item(&mut self, key: &str) -> Result<Option<Item>> {
        if key.is_empty() {
            return Err(CacheError::InvalidArgument("empty key".to_string()));
        }
        let Some(mut item) = self.db.get(key, true)? else {
            return Ok(None);
        };
        if let Some(name) = item.filename.clone() {
            match self.files.read(&name)? {
                Some(bytes) => item.value = Some(bytes),
                None => {
                    warn!(key, file = %name, "backing file missing, pruning orphaned row");
                    self.db.delete(key)?;
                    return Ok(None);
                }
            }
        }
        if let Err(err) = self.db.update_access_time(key) {
            debug!(key, %err, "access time update failed");
        }
        Ok(Some(item))
    }

    /// Metadata-only look-up: no inline bytes, no file read, no access
    /// time refresh.
    pub fn get_item_info(&mut self, key: &str) -> Result<Option<Item>> {
        if key.is_empty() {
            return Err(CacheError::InvalidArgument("empty key".to_string()));
        }
        self.db.get(key, false)
    }

    /// Just the value bytes.
    pub fn get_item_value(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get_item(key)?.and_then(|item| item.value))
    }

    // == Multi-Key Get ==
    /// Fetches every present key with value bytes. Individual file-read
    /// failures do not abort the loop: the affected rows are pruned and
    /// excluded from the result. The result is an error only when the
    /// manifest query itself failed.
    pub fn get_items_for_keys(&mut self, keys: &[&str]) -> Result<Vec<Item>> {
        if keys.is_empty() {
            return Err(CacheError::InvalidArgument("empty key list".to_string()));
        }
        let fetched = self.db.get_many(keys, true)?;
        let mut kept = Vec::with_capacity(fetched.len());
        let mut orphaned: Vec<String> = Vec::new();
        for mut item in fetched {
            if let Some(name) = item.filename.clone() {
                match self.files.read(&name) {
                    Ok(Some(bytes)) => item.value = Some(bytes),
                    Ok(None) | Err(_) => {
                        warn!(key = %item.key, file = %name, "pruning unreadable row");
                        orphaned.push(item.key);
                        continue;
                    }
                }
            }
            kept.push(item);
        }
        if !orphaned.is_empty() {
            let refs: Vec<&str> = orphaned.iter().map(String::as_str).collect();
            if let Err(err) = self.db.delete_keys(&refs) {
                warn!(%err, "orphan prune failed");
            }
        }
        if !kept.is_empty() {
            let refs: Vec<&str> = kept.iter().map(|item| item.key.as_str()).collect();
            if let Err(err) = self.db.update_access_times(&refs) {
                debug!(%err, "access time update failed");
            }
        }
        Ok(kept)
    }

    /// Metadata-only variant of [`get_items_for_keys`](Self::get_items_for_keys).
    pub fn get_item_infos_for_keys(&mut self, keys: &[&str]) -> Result<Vec<Item>> {
        if keys.is_empty() {
            return Err(CacheError::InvalidArgument("empty key list".to_string()));
        }
        self.db.get_many(keys, false)
    }

    // == Existence and Sizes ==

    pub fn item_exists(&mut self, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Err(CacheError::InvalidArgument("empty key".to_string()));
        }
        Ok(self.db.count_key(key)? > 0)
    }

    pub fn items_count(&mut self) -> Result<u64> {
        self.db.count_all()
    }

    pub fn items_size(&mut self) -> Result<u64> {
        self.db.sum_size()
    }

    // == Removal ==

    pub fn remove_item(&mut self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(CacheError::InvalidArgument("empty key".to_string()));
        }
        if let Some(name) = self.db.get_filename(key)? {
            if let Err(err) = self.files.delete(&name) {
                debug!(key, file = %name, %err, "file delete failed");
            }
        }
        self.db.delete(key)
    }

    pub fn remove_items(&mut self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Err(CacheError::InvalidArgument("empty key list".to_string()));
        }
        for name in self.db.get_filenames(keys)? {
            if let Err(err) = self.files.delete(&name) {
                debug!(file = %name, %err, "file delete failed");
            }
        }
        self.db.delete_keys(keys)?;
        self.checkpoint_after_bulk();
        Ok(())
    }

    /// Removes every item whose size exceeds `size` bytes.
    pub fn remove_items_larger_than(&mut self, size: u64) -> Result<()> {
        if size == u64::MAX {
            return Ok(());
        }
        for name in self.db.get_filenames_larger_than(size)? {
            if let Err(err) = self.files.delete(&name) {
                debug!(file = %name, %err, "file delete failed");
            }
        }
        self.db.delete_larger_than(size)?;
        self.checkpoint_after_bulk();
        Ok(())
    }

    /// Removes every item last accessed strictly before `timestamp`
    /// (Unix seconds); an item accessed in the cutoff second survives.
    pub fn remove_items_earlier_than(&mut self, timestamp: i64) -> Result<()> {
        if timestamp <= 0 {
            return Ok(());
        }
        for name in self.db.get_filenames_earlier_than(timestamp)? {
            if let Err(err) = self.files.delete(&name) {
                debug!(file = %name, %err, "file delete failed");
            }
        }
        self.db.delete_earlier_than(timestamp)?;
        self.checkpoint_after_bulk();
        Ok(())
    }

    /// Evicts oldest-first until the total size is at most `max_size`
    /// bytes.
    pub fn remove_items_to_fit_size(&mut self, max_size: u64) -> Result<()> {
        if max_size == u64::MAX {
            return Ok(());
        }
        if max_size == 0 {
            return self.remove_all_items();
        }
        let mut total = self.db.sum_size()?;
        if total <= max_size {
            return Ok(());
        }
        'outer: loop {
            let batch = self.db.get_oldest(TRIM_PAGE)?;
            if batch.is_empty() {
                break;
            }
            for row in &batch {
                if total <= max_size {
                    break 'outer;
                }
                self.delete_candidate(row)?;
                total = total.saturating_sub(row.size);
            }
        }
        self.checkpoint_after_bulk();
        Ok(())
    }

    /// Evicts oldest-first until at most `max_count` items remain.
    pub fn remove_items_to_fit_count(&mut self, max_count: u64) -> Result<()> {
        if max_count == u64::MAX {
            return Ok(());
        }
        if max_count == 0 {
            return self.remove_all_items();
        }
        let mut total = self.db.count_all()?;
        if total <= max_count {
            return Ok(());
        }
        'outer: loop {
            let batch = self.db.get_oldest(TRIM_PAGE)?;
            if batch.is_empty() {
                break;
            }
            for row in &batch {
                if total <= max_count {
                    break 'outer;
                }
                self.delete_candidate(row)?;
                total = total.saturating_sub(1);
            }
        }
        self.checkpoint_after_bulk();
        Ok(())
    }

    // == Remove All ==
    /// Full reset: the manifest files are deleted outright, `data/`
    /// moves to trash wholesale, the trash purge starts in the
    /// background, and a fresh manifest is initialized.
    pub fn remove_all_items(&mut self) -> Result<()> {
        self.db.close();
        delete_db_files(&self.root)?;
        self.files.move_all_to_trash()?;
        self.files.empty_trash_in_background();
        self.db.ensure_open()?;
        info!(root = %self.root.display(), "store reset");
        Ok(())
    }

    /// Removal with progress reporting: deletes oldest-first in pages,
    /// invoking `on_progress(removed, total)` after each page and
    /// `on_end(errored)` exactly once. `errored` is true when the
    /// initial count failed or any deletion failed mid-iteration.
    pub fn remove_all_items_with_progress<P, E>(&mut self, mut on_progress: P, on_end: E)
    where
        P: FnMut(u64, u64),
        E: FnOnce(bool),
    {
        let total = match self.db.count_all() {
            Ok(total) => total,
            Err(err) => {
                error!(%err, "item count failed");
                on_end(true);
                return;
            }
        };
        if total == 0 {
            on_end(false);
            return;
        }
        let mut removed: u64 = 0;
        loop {
            let batch = match self.db.get_oldest(PROGRESS_PAGE) {
                Ok(batch) => batch,
                Err(err) => {
                    error!(%err, "oldest-row scan failed");
                    on_end(true);
                    return;
                }
            };
            if batch.is_empty() {
                break;
            }
            for row in &batch {
                if let Err(err) = self.delete_candidate(row) {
                    error!(key = %row.key, %err, "deletion failed");
                    on_end(true);
                    return;
                }
                removed += 1;
            }
            on_progress(removed, total);
        }
        self.checkpoint_after_bulk();
        on_end(false);
    }

    // == Internals ==

    fn delete_candidate(&mut self, row: &TrimCandidate) -> Result<()> {
        if let Some(name) = &row.filename {
            if let Err(err) = self.files.delete(name) {
                debug!(key = %row.key, file = %name, %err, "file delete failed");
            }
        }
        self.db.delete(&row.key)
    }

    fn checkpoint_after_bulk(&mut self) {
        if let Err(err) = self.db.checkpoint() {
            debug!(%err, "checkpoint failed");
        }
    }
}

fn delete_db_files(root: &Path) -> Result<()> {
    for name in [DB_FILENAME, DB_SHM_FILENAME, DB_WAL_FILENAME] {
        match fs::remove_file(root.join(name)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

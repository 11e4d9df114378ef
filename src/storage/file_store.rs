//! File Store Module
//!
//! Persists opaque byte sequences as regular files under `data/` and
//! stages bulk reclamation through a `trash/` directory drained by an
//! asynchronous purge worker.
//!
//! Nothing ever reads trash content; the only operation on it is
//! destruction.

use std::fs;
use std::path::{Path, PathBuf};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

const DATA_DIR: &str = "data";
const TRASH_DIR: &str = "trash";

// == File Store ==
pub(crate) struct FileStore {
    data_dir: PathBuf,
    trash_dir: PathBuf,
    /// Serial purge queue; `None` when no runtime was current at
    /// construction, in which case purging happens inline.
    purge_tx: Option<mpsc::UnboundedSender<PathBuf>>,
}

impl FileStore {
    // == Constructor ==
    /// Creates `data/` and `trash/` under `root` and starts the purge
    /// worker when a runtime is available.
    pub fn new(root: &Path) -> Result<Self> {
        let data_dir = root.join(DATA_DIR);
        let trash_dir = root.join(TRASH_DIR);
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&trash_dir)?;

        let purge_tx = Handle::try_current().ok().map(|handle| {
            let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
            handle.spawn(async move {
                while let Some(path) = rx.recv().await {
                    let _ = tokio::task::spawn_blocking(move || purge_path(&path)).await;
                }
            });
            tx
        });

        Ok(Self {
            data_dir,
            trash_dir,
            purge_tx,
        })
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.data_dir.join(filename)
    }

    // == Write ==
    /// Writes `bytes` to `data/<filename>`, overwriting any previous
    /// content.
    pub fn write(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        fs::write(self.file_path(filename), bytes)?;
        Ok(())
    }

    // == Read ==
    /// Reads the whole file, or `None` when it does not exist.
    pub fn read(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.file_path(filename)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    // == Delete ==
    /// Removes the file. Absence is a failure at this level; callers
    /// decide whether that matters.
    pub fn delete(&self, filename: &str) -> Result<()> {
        fs::remove_file(self.file_path(filename))?;
        Ok(())
    }

    // == Move All To Trash ==
    /// Renames the whole `data/` directory into a fresh trash slot and
    /// recreates an empty `data/`. This is the reclamation primitive
    /// for full reset and rebuild.
    pub fn move_all_to_trash(&self) -> Result<()> {
        fs::create_dir_all(&self.trash_dir)?;
        let staged = self.trash_dir.join(Uuid::new_v4().to_string());
        match fs::rename(&self.data_dir, &staged) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(&self.data_dir)?;
        debug!(staged = %staged.display(), "data directory staged for purge");
        Ok(())
    }

    // == Empty Trash In Background ==
    /// Queues every current trash entry for destruction on the purge
    /// worker. Errors are logged, never surfaced.
    pub fn empty_trash_in_background(&self) {
        let entries = match fs::read_dir(&self.trash_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, "failed to enumerate trash");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            match &self.purge_tx {
                Some(tx) => {
                    if let Err(returned) = tx.send(path) {
                        purge_path(&returned.0);
                    }
                }
                None => purge_path(&path),
            }
        }
    }
}

// == Purge ==
fn purge_path(path: &Path) {
    let outcome = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match outcome {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "failed to purge trash entry"),
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileStore) {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::new(dir.path()).expect("file store");
        (dir, store)
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, store) = store();
        store.write("blob", b"payload").unwrap();

        assert_eq!(store.read("blob").unwrap(), Some(b"payload".to_vec()));
    }

    #[test]
    fn test_write_overwrites() {
        let (_dir, store) = store();
        store.write("blob", b"first").unwrap();
        store.write("blob", b"second").unwrap();

        assert_eq!(store.read("blob").unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn test_read_missing_returns_none() {
        let (_dir, store) = store();
        assert_eq!(store.read("absent").unwrap(), None);
    }

    #[test]
    fn test_delete_missing_is_a_failure() {
        let (_dir, store) = store();
        assert!(store.delete("absent").is_err());
    }

    #[test]
    fn test_delete_existing() {
        let (_dir, store) = store();
        store.write("blob", b"payload").unwrap();
        store.delete("blob").unwrap();

        assert_eq!(store.read("blob").unwrap(), None);
    }

    #[test]
    fn test_move_all_to_trash_recreates_data() {
        let (dir, store) = store();
        store.write("blob", b"payload").unwrap();

        store.move_all_to_trash().unwrap();

        assert_eq!(store.read("blob").unwrap(), None);
        assert!(dir.path().join(DATA_DIR).is_dir());
        // The old content sits in a staged trash directory.
        let staged: Vec<_> = fs::read_dir(dir.path().join(TRASH_DIR))
            .unwrap()
            .flatten()
            .collect();
        assert_eq!(staged.len(), 1);
        assert!(staged[0].path().join("blob").is_file());
    }

    #[test]
    fn test_empty_trash_inline_without_runtime() {
        let (dir, store) = store();
        store.write("blob", b"payload").unwrap();
        store.move_all_to_trash().unwrap();

        store.empty_trash_in_background();

        let left: Vec<_> = fs::read_dir(dir.path().join(TRASH_DIR))
            .unwrap()
            .flatten()
            .collect();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn test_empty_trash_drains_on_worker() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::new(dir.path()).expect("file store");
        store.write("blob", b"payload").unwrap();
        store.move_all_to_trash().unwrap();

        store.empty_trash_in_background();

        let trash = dir.path().join(TRASH_DIR);
        for _ in 0..100 {
            if fs::read_dir(&trash).map(|e| e.count() == 0).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(fs::read_dir(&trash).unwrap().count(), 0);
    }
}

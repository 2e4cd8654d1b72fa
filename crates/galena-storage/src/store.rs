//! The storage engine proper: in-memory index over the op log.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use bytes::Bytes;
use tracing::{debug, info};

use galena_types::ClockTime;

use crate::log::{LogRecord, MAGIC};
use crate::{StorageError, StorageResult};

/// One indexed entry: either a live value or a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Stamp of the write that produced this entry.
    pub clocktime: ClockTime,
    /// `None` marks a tombstone.
    pub value: Option<Bytes>,
}

impl Entry {
    pub fn is_live(&self) -> bool {
        self.value.is_some()
    }
}

/// The local key-value engine.
///
/// All mutations append to the op log before touching the index, so a
/// crash can lose at most the torn tail of the last append. The index
/// lock is never held across file writes of other keys' data; the log
/// writer has its own mutex and appends are serialized through it.
pub struct Store {
    path: PathBuf,
    index: RwLock<HashMap<Bytes, Entry>>,
    writer: Mutex<BufWriter<File>>,
}

impl Store {
    /// Opens the engine at `path`, creating an empty log or replaying an
    /// existing one.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut index = HashMap::new();

        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;

        if exists && file.metadata()?.len() > 0 {
            replay(&path, &mut index)?;
        } else {
            file.write_all(MAGIC)?;
            file.flush()?;
        }

        info!(path = %path.display(), items = index.len(), "opened store");

        Ok(Self {
            path,
            index: RwLock::new(index),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Looks up a live value. Tombstoned and absent keys both return `None`.
    pub fn get(&self, key: &[u8]) -> Option<(ClockTime, Bytes)> {
        let index = self.index.read().expect("index lock poisoned");
        index
            .get(key)
            .and_then(|e| e.value.clone().map(|v| (e.clocktime, v)))
    }

    /// Returns the stamp recorded for a key, tombstones included.
    pub fn stamp_of(&self, key: &[u8]) -> Option<ClockTime> {
        let index = self.index.read().expect("index lock poisoned");
        index.get(key).map(|e| e.clocktime)
    }

    /// Unconditionally stores `value` under `key` with stamp `ct`.
    ///
    /// The coordinator path: the stamp was just issued locally and is
    /// known to be newer than anything stored.
    pub fn set(&self, key: &[u8], value: &[u8], ct: ClockTime) -> StorageResult<()> {
        let key = Bytes::copy_from_slice(key);
        let value = Bytes::copy_from_slice(value);
        self.append(&LogRecord::Set {
            key: key.clone(),
            value: value.clone(),
            clocktime: ct,
        })?;
        let mut index = self.index.write().expect("index lock poisoned");
        index.insert(
            key,
            Entry {
                clocktime: ct,
                value: Some(value),
            },
        );
        Ok(())
    }

    /// Stores only when `ct` is strictly newer than the recorded stamp.
    ///
    /// The replica path: returns whether the write was applied. A `false`
    /// return means the stored entry (live or tombstone) already carries
    /// an equal or newer stamp and the incoming write is a no-op.
    pub fn set_if_newer(&self, key: &[u8], value: &[u8], ct: ClockTime) -> StorageResult<bool> {
        if let Some(stored) = self.stamp_of(key) {
            if stored >= ct {
                return Ok(false);
            }
        }
        self.set(key, value, ct)?;
        Ok(true)
    }

    /// Tombstones `key` with stamp `ct`.
    ///
    /// Returns whether a live value existed beforehand.
    pub fn remove(&self, key: &[u8], ct: ClockTime) -> StorageResult<bool> {
        let key = Bytes::copy_from_slice(key);
        self.append(&LogRecord::Delete {
            key: key.clone(),
            clocktime: ct,
        })?;
        let mut index = self.index.write().expect("index lock poisoned");
        let existed = index.get(&key).is_some_and(Entry::is_live);
        index.insert(
            key,
            Entry {
                clocktime: ct,
                value: None,
            },
        );
        Ok(existed)
    }

    /// Tombstones only when `ct` is strictly newer than the recorded stamp.
    pub fn remove_if_newer(&self, key: &[u8], ct: ClockTime) -> StorageResult<bool> {
        if let Some(stored) = self.stamp_of(key) {
            if stored >= ct {
                return Ok(false);
            }
        }
        self.remove(key, ct)?;
        Ok(true)
    }

    /// Number of live entries.
    pub fn items(&self) -> u64 {
        let index = self.index.read().expect("index lock poisoned");
        index.values().filter(|e| e.is_live()).count() as u64
    }

    /// Snapshot of all live entries.
    ///
    /// The rebalance scan iterates this without holding the index lock
    /// while streaming to peers.
    pub fn snapshot_live(&self) -> Vec<(Bytes, Bytes, ClockTime)> {
        let index = self.index.read().expect("index lock poisoned");
        index
            .iter()
            .filter_map(|(k, e)| {
                e.value
                    .clone()
                    .map(|v| (k.clone(), v, e.clocktime))
            })
            .collect()
    }

    /// Flushes buffered appends to the OS.
    pub fn flush(&self) -> StorageResult<()> {
        let mut writer = self.writer.lock().expect("writer lock poisoned");
        writer.flush()?;
        Ok(())
    }

    /// Copies the op log to `{path}-{suffix}` and returns the new path.
    pub fn backup(&self, suffix: &str) -> StorageResult<PathBuf> {
        let dst = PathBuf::from(format!("{}-{suffix}", self.path.display()));
        {
            // Hold the writer lock across the copy so the snapshot is a
            // record boundary, not a torn append.
            let mut writer = self.writer.lock().expect("writer lock poisoned");
            writer.flush()?;
            fs::copy(&self.path, &dst)?;
        }
        info!(dst = %dst.display(), "backup complete");
        Ok(dst)
    }

    /// The op-log path this store was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &LogRecord) -> StorageResult<()> {
        let mut writer = self.writer.lock().expect("writer lock poisoned");
        record.write_to(&mut *writer)?;
        writer.flush()?;
        Ok(())
    }
}

fn replay(path: &Path, index: &mut HashMap<Bytes, Entry>) -> StorageResult<()> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; MAGIC.len()];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(StorageError::BadMagic {
            path: path.display().to_string(),
        });
    }

    let mut offset = reader.stream_position().unwrap_or(MAGIC.len() as u64);
    let mut replayed = 0u64;
    while let Some(record) = LogRecord::read_from(&mut reader, offset)? {
        offset += record.encoded_len();
        replayed += 1;
        match record {
            LogRecord::Set {
                key,
                value,
                clocktime,
            } => {
                index.insert(
                    key,
                    Entry {
                        clocktime,
                        value: Some(value),
                    },
                );
            }
            LogRecord::Delete { key, clocktime } => {
                index.insert(
                    key,
                    Entry {
                        clocktime,
                        value: None,
                    },
                );
            }
        }
    }

    debug!(records = replayed, "op log replayed");
    Ok(())
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("items", &self.items())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ct(secs: u32, clock: u32) -> ClockTime {
        ClockTime::new(secs, clock)
    }

    #[test]
    fn set_then_get() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        store.set(b"foo", b"hello", ct(1, 1)).unwrap();
        assert_eq!(
            store.get(b"foo"),
            Some((ct(1, 1), Bytes::from_static(b"hello")))
        );
        assert_eq!(store.get(b"bar"), None);
        assert_eq!(store.items(), 1);
    }

    #[test]
    fn newer_write_wins() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        store.set(b"k", b"v1", ct(1, 1)).unwrap();
        assert!(store.set_if_newer(b"k", b"v2", ct(1, 2)).unwrap());
        assert_eq!(store.get(b"k").unwrap().1, Bytes::from_static(b"v2"));
    }

    #[test]
    fn stale_replicate_is_ignored() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        store.set(b"k", b"new", ct(5, 0)).unwrap();
        assert!(!store.set_if_newer(b"k", b"old", ct(4, 9)).unwrap());
        assert!(!store.set_if_newer(b"k", b"tied", ct(5, 0)).unwrap());
        assert_eq!(store.get(b"k").unwrap().1, Bytes::from_static(b"new"));
    }

    #[test]
    fn delete_leaves_tombstone_with_stamp() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        store.set(b"k", b"v", ct(1, 1)).unwrap();
        assert!(store.remove(b"k", ct(1, 2)).unwrap());
        assert_eq!(store.get(b"k"), None);
        assert_eq!(store.stamp_of(b"k"), Some(ct(1, 2)));
        assert_eq!(store.items(), 0);

        // A set that lost the race to the delete must not resurrect it.
        assert!(!store.set_if_newer(b"k", b"ghost", ct(1, 1)).unwrap());
        assert_eq!(store.get(b"k"), None);
    }

    #[test]
    fn delete_of_absent_key_reports_not_found() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        assert!(!store.remove(b"nope", ct(1, 1)).unwrap());
    }

    #[test]
    fn remove_if_newer_respects_stamps() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        store.set(b"k", b"v", ct(2, 0)).unwrap();
        assert!(!store.remove_if_newer(b"k", ct(1, 9)).unwrap());
        assert!(store.get(b"k").is_some());
        assert!(store.remove_if_newer(b"k", ct(2, 1)).unwrap());
        assert!(store.get(b"k").is_none());
    }

    #[test]
    fn reopen_replays_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = Store::open(&path).unwrap();
            store.set(b"a", b"1", ct(1, 1)).unwrap();
            store.set(b"b", b"2", ct(1, 2)).unwrap();
            store.set(b"a", b"3", ct(1, 3)).unwrap();
            store.remove(b"b", ct(1, 4)).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.get(b"a").unwrap().1, Bytes::from_static(b"3"));
        assert_eq!(store.get(b"b"), None);
        assert_eq!(store.stamp_of(b"b"), Some(ct(1, 4)));
        assert_eq!(store.items(), 1);
    }

    #[test]
    fn reopen_survives_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = Store::open(&path).unwrap();
            store.set(b"a", b"1", ct(1, 1)).unwrap();
        }
        // Simulate a crash mid-append.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0u8; 5]).unwrap();
        drop(file);

        let store = Store::open(&path).unwrap();
        assert_eq!(store.get(b"a").unwrap().1, Bytes::from_static(b"1"));
    }

    #[test]
    fn backup_copies_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let store = Store::open(&path).unwrap();
        store.set(b"k", b"v", ct(1, 1)).unwrap();
        let backup = store.backup("20260801").unwrap();
        assert_eq!(backup, dir.path().join("db-20260801"));

        let restored = Store::open(&backup).unwrap();
        assert_eq!(restored.get(b"k").unwrap().1, Bytes::from_static(b"v"));
    }

    #[test]
    fn snapshot_excludes_tombstones() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        store.set(b"a", b"1", ct(1, 1)).unwrap();
        store.set(b"b", b"2", ct(1, 2)).unwrap();
        store.remove(b"a", ct(1, 3)).unwrap();
        let snapshot = store.snapshot_live();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, Bytes::from_static(b"b"));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        fs::write(&path, b"NOPE").unwrap();
        assert!(matches!(
            Store::open(&path),
            Err(StorageError::BadMagic { .. })
        ));
    }
}

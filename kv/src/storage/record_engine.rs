use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{CResult, Error};
use crate::storage::engine::Engine;
use crate::storage::log::Log;
use crate::storage::{KeyDir, ScanIteratorT, Status};

/// A crash-safe, append-only key/value engine: a data file, an offset index
/// that is the source of truth for which keys are live, and a write-ahead
/// log that makes every `set`/`delete` replayable after a crash.
///
/// Unlike a single append-only log carrying both live and tombstoned
/// entries, writes here land in `<name>.wal` first, are then applied to
/// `<name>.dat`, and the offset index is persisted to `<name>.idx` before
/// the WAL is cleared. The on-disk entry format (`[key_len:u32
/// BE][value_len:i32 BE][key][value]`, -1 length for tombstones) is
/// unchanged from `Log`.
pub struct RecordEngine {
    data: Log,
    wal: Log,
    idx_path: PathBuf,
    keydir: KeyDir,
}

impl RecordEngine {
    /// Opens or creates the engine rooted at `base` (`base.dat`, `base.idx`,
    /// `base.wal`). Takes out exclusive file locks on the data and WAL
    /// files to exclude other processes.
    pub fn new(base: PathBuf) -> CResult<Self> {
        Self::new_with_lock(base, true)
    }

    pub fn new_with_lock(base: PathBuf, try_lock: bool) -> CResult<Self> {
        let data_path = with_ext(&base, "dat");
        let wal_path = with_ext(&base, "wal");
        let idx_path = with_ext(&base, "idx");

        let mut data = Log::new_with_lock(data_path, try_lock)?;
        let mut wal = Log::new_with_lock(wal_path, try_lock)?;

        let keydir = match load_index(&idx_path)? {
            Some(keydir) => keydir,
            None => data.build_keydir()?,
        };

        let mut engine = Self { data, wal, idx_path, keydir };
        engine.replay_wal()?;
        Ok(engine)
    }

    /// Applies every record found in the WAL to the data file and offset
    /// index, then truncates the WAL. Safe to call on an empty WAL (no-op).
    fn replay_wal(&mut self) -> CResult<()> {
        let entries = self.wal.read_all_entries()?;
        if entries.is_empty() {
            return Ok(());
        }

        log::info!("replaying {} wal entries for {:?}", entries.len(), self.data.path());
        for (key, value) in entries {
            match value {
                Some(value) => self.apply_set(&key, value)?,
                None => self.apply_delete(&key)?,
            }
        }
        self.truncate_wal()?;
        self.persist_index()
    }

    fn apply_set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        let (pos, len) = self.data.write_entry(key, Some(&value))?;
        let value_len = value.len() as u32;
        self.keydir.insert(key.to_vec(), (pos + len as u64 - value_len as u64, value_len));
        Ok(())
    }

    fn apply_delete(&mut self, key: &[u8]) -> CResult<()> {
        self.data.write_entry(key, None)?;
        self.keydir.remove(key);
        Ok(())
    }

    fn truncate_wal(&mut self) -> CResult<()> {
        self.wal.truncate()
    }

    fn persist_index(&self) -> CResult<()> {
        save_index(&self.idx_path, &self.keydir)
    }

    pub fn get_path(&self) -> Option<&str> {
        self.data.path().to_str()
    }
}

fn with_ext(base: &Path, ext: &str) -> PathBuf {
    let mut p = base.to_path_buf();
    p.set_extension(ext);
    p
}

/// Index-file key encoding: raw keys may be arbitrary bytes, so the JSON
/// index maps hex-encoded keys to their data-file offsets.
fn save_index(idx_path: &Path, keydir: &KeyDir) -> CResult<()> {
    let encoded: BTreeMap<String, (u64, u32)> =
        keydir.iter().map(|(k, v)| (hex::encode(k), *v)).collect();
    let bytes = serde_json::to_vec(&encoded)?;
    std::fs::write(idx_path, bytes)?;
    Ok(())
}

fn load_index(idx_path: &Path) -> CResult<Option<KeyDir>> {
    if !idx_path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(idx_path)?;
    if bytes.is_empty() {
        return Ok(None);
    }
    let encoded: BTreeMap<String, (u64, u32)> = serde_json::from_slice(&bytes)?;
    let mut keydir = KeyDir::new();
    for (k, v) in encoded {
        let key = hex::decode(&k).map_err(|e| Error::CodecError(e.to_string()))?;
        keydir.insert(key, v);
    }
    Ok(Some(keydir))
}

impl std::fmt::Display for RecordEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "record engine")
    }
}

impl Engine for RecordEngine {
    type ScanIterator<'a> = RecordScanIterator<'a>;

    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.wal.write_entry(key, None)?;
        self.wal.sync_all()?;
        self.apply_delete(key)?;
        self.data.sync_all()?;
        self.persist_index()?;
        self.truncate_wal()
    }

    fn flush(&mut self) -> CResult<()> {
        self.data.sync_all()?;
        self.wal.sync_all()
    }

    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        if let Some((value_pos, value_len)) = self.keydir.get(key) {
            Ok(Some(self.data.read_value(*value_pos, *value_len)?))
        } else {
            Ok(None)
        }
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_>
    where
        Self: Sized,
    {
        RecordScanIterator { inner: self.keydir.range(range), data: &mut self.data }
    }

    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn ScanIteratorT + '_> {
        Box::new(self.scan(range))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.wal.write_entry(key, Some(&value))?;
        self.wal.sync_all()?;
        self.apply_set(key, value)?;
        self.data.sync_all()?;
        self.persist_index()?;
        self.truncate_wal()
    }

    fn status(&mut self) -> CResult<Status> {
        let keys = self.keydir.len() as u64;
        let size = self
            .keydir
            .iter()
            .fold(0, |size, (key, (_, value_len))| size + key.len() as u64 + *value_len as u64);
        let total_disk_size = self.data.len()?;
        let live_disk_size = size + 8 * keys;
        let garbage_disk_size = total_disk_size.saturating_sub(live_disk_size);
        Ok(Status {
            name: self.to_string(),
            keys,
            size,
            total_disk_size,
            live_disk_size,
            garbage_disk_size,
        })
    }
}

pub struct RecordScanIterator<'a> {
    inner: std::collections::btree_map::Range<'a, Vec<u8>, (u64, u32)>,
    data: &'a mut Log,
}

impl<'a> RecordScanIterator<'a> {
    fn map(&mut self, item: (&Vec<u8>, &(u64, u32))) -> <Self as Iterator>::Item {
        let (key, (value_pos, value_len)) = item;
        Ok((key.clone(), self.data.read_value(*value_pos, *value_len)?))
    }
}

impl<'a> Iterator for RecordScanIterator<'a> {
    type Item = CResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| self.map(item))
    }
}

impl<'a> DoubleEndedIterator for RecordScanIterator<'a> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|item| self.map(item))
    }
}

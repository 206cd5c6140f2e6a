//! Disk Collection
//!
//! Overflow tier for records pushed out of RAM.
//!
//! # Design
//!
//! - Append-only log `data.log` of `[key_len u32][value_len u32][key][value]`
//!   records; a `value_len` of `u32::MAX` is a tombstone
//! - In-memory index `key -> (offset, value_len)` rebuilt by replaying the log
//!   on open, so contents survive a restart
//! - A truncated tail record (crash mid-write) is cut off during replay
//! - Compaction rewrites live records once garbage outweighs them

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Log file name inside the disk directory
pub const LOG_FILE: &str = "data.log";

const RECORD_HEADER: u64 = 8;
const TOMBSTONE: u32 = u32::MAX;

/// Disk tier configuration
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Directory holding the log
    pub path: PathBuf,
    /// Live byte budget, 0 for unlimited
    pub max_bytes: u64,
    /// fsync after every write instead of only flushing
    pub sync_writes: bool,
    /// Garbage below this size never triggers compaction
    pub compaction_threshold: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./.slabs"),
            max_bytes: 0,
            sync_writes: false,
            compaction_threshold: 16 * 1024 * 1024,
        }
    }
}

impl DiskConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Location {
    offset: u64,
    key_len: u32,
    value_len: u32,
}

impl Location {
    fn record_len(&self) -> u64 {
        RECORD_HEADER + self.key_len as u64 + self.value_len as u64
    }
}

/// Log-structured on-disk key/value map
#[derive(Debug)]
pub struct DiskCollection {
    config: DiskConfig,
    file: File,
    index: HashMap<Bytes, Location>,
    end: u64,
    live_bytes: u64,
    garbage_bytes: u64,
}

impl DiskCollection {
    /// Open (or create) the log and rebuild the index
    pub fn open(config: DiskConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        let path = config.path.join(LOG_FILE);
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut disk = Self {
            config,
            file,
            index: HashMap::new(),
            end: 0,
            live_bytes: 0,
            garbage_bytes: 0,
        };
        disk.replay(&path)?;

        info!(
            path = %path.display(),
            keys = disk.index.len(),
            live_bytes = disk.live_bytes,
            "Opened disk collection"
        );
        Ok(disk)
    }

    fn log_path(&self) -> PathBuf {
        self.config.path.join(LOG_FILE)
    }

    fn replay(&mut self, path: &Path) -> Result<()> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut offset = 0u64;

        loop {
            let mut header = [0u8; RECORD_HEADER as usize];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let key_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let value_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            let mut key = vec![0u8; key_len as usize];
            if let Err(e) = reader.read_exact(&mut key) {
                if e.kind() == ErrorKind::UnexpectedEof {
                    break;
                }
                return Err(e.into());
            }

            if value_len == TOMBSTONE {
                if let Some(old) = self.index.remove(key.as_slice()) {
                    self.live_bytes -= old.record_len();
                    self.garbage_bytes += old.record_len();
                }
                let len = RECORD_HEADER + key_len as u64;
                self.garbage_bytes += len;
                offset += len;
                continue;
            }

            // Skip the value; a short skip means a torn record
            let skipped = std::io::copy(
                &mut (&mut reader).take(value_len as u64),
                &mut std::io::sink(),
            )?;
            if skipped < value_len as u64 {
                break;
            }

            let location = Location {
                offset,
                key_len,
                value_len,
            };
            if let Some(old) = self.index.insert(Bytes::from(key), location) {
                self.live_bytes -= old.record_len();
                self.garbage_bytes += old.record_len();
            }
            self.live_bytes += location.record_len();
            offset += location.record_len();
        }

        let file_len = self.file.metadata()?.len();
        if offset < file_len {
            warn!(
                valid = offset,
                file_len, "Discarding torn record at the end of the disk log"
            );
            OpenOptions::new().write(true).open(path)?.set_len(offset)?;
        }
        self.end = offset;
        Ok(())
    }

    // =========================================================================
    // Key Operations
    // =========================================================================

    /// Append a record for `key`, replacing any previous one
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let key_len = u32::try_from(key.len())
            .map_err(|_| Error::Capacity { size: key.len() })?;
        let value_len = u32::try_from(value.len())
            .ok()
            .filter(|len| *len != TOMBSTONE)
            .ok_or(Error::Capacity { size: value.len() })?;

        let location = Location {
            offset: self.end,
            key_len,
            value_len,
        };
        let previous = self.index.get(key).map(Location::record_len).unwrap_or(0);
        if self.config.max_bytes > 0
            && self.live_bytes - previous + location.record_len() > self.config.max_bytes
        {
            return Err(Error::Capacity {
                size: location.record_len() as usize,
            });
        }

        self.append(key_len, value_len, key, value)?;

        if let Some(old) = self.index.insert(Bytes::copy_from_slice(key), location) {
            self.live_bytes -= old.record_len();
            self.garbage_bytes += old.record_len();
        }
        self.live_bytes += location.record_len();
        self.maybe_compact()
    }

    /// Read the value stored for `key`
    pub fn find(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        let Some(location) = self.index.get(key).copied() else {
            return Ok(None);
        };
        self.file.seek(SeekFrom::Start(
            location.offset + RECORD_HEADER + location.key_len as u64,
        ))?;
        let mut value = vec![0u8; location.value_len as usize];
        self.file.read_exact(&mut value)?;
        Ok(Some(Bytes::from(value)))
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    /// Bytes a record takes in the log
    pub fn record_len(key_len: usize, value_len: usize) -> u64 {
        RECORD_HEADER + key_len as u64 + value_len as u64
    }

    /// Whether `bytes` more live data stays within the budget
    pub fn has_room(&self, bytes: u64) -> bool {
        self.config.max_bytes == 0 || self.live_bytes.saturating_add(bytes) <= self.config.max_bytes
    }

    /// Drop `key`; returns whether it was present
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let Some(old) = self.index.remove(key) else {
            return Ok(false);
        };
        let key_len = old.key_len;
        self.append(key_len, TOMBSTONE, key, &[])?;
        self.live_bytes -= old.record_len();
        self.garbage_bytes += old.record_len() + RECORD_HEADER + key_len as u64;
        self.maybe_compact()?;
        Ok(true)
    }

    fn append(&mut self, key_len: u32, value_len: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let mut record = Vec::with_capacity(RECORD_HEADER as usize + key.len() + value.len());
        record.extend_from_slice(&key_len.to_le_bytes());
        record.extend_from_slice(&value_len.to_le_bytes());
        record.extend_from_slice(key);
        record.extend_from_slice(value);

        self.file.write_all(&record)?;
        self.file.flush()?;
        if self.config.sync_writes {
            self.file.sync_data()?;
        }
        self.end += record.len() as u64;
        Ok(())
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    fn maybe_compact(&mut self) -> Result<()> {
        if self.garbage_bytes > self.config.compaction_threshold
            && self.garbage_bytes > self.live_bytes
        {
            self.compact()?;
        }
        Ok(())
    }

    /// Rewrite the log with live records only
    pub fn compact(&mut self) -> Result<()> {
        let path = self.log_path();
        let tmp_path = self.config.path.join(format!("{LOG_FILE}.compact"));

        let mut entries: Vec<(Bytes, Location)> =
            self.index.iter().map(|(k, l)| (k.clone(), *l)).collect();
        entries.sort_by_key(|(_, l)| l.offset);

        let mut new_index = HashMap::with_capacity(entries.len());
        let mut offset = 0u64;
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for (key, location) in entries {
                self.file.seek(SeekFrom::Start(location.offset))?;
                let mut record = vec![0u8; location.record_len() as usize];
                self.file.read_exact(&mut record)?;
                writer.write_all(&record)?;
                new_index.insert(
                    key,
                    Location {
                        offset,
                        ..location
                    },
                );
                offset += location.record_len();
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, &path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&path)?;

        debug!(
            reclaimed = self.garbage_bytes,
            live = self.live_bytes,
            "Compacted disk log"
        );
        self.index = new_index;
        self.end = offset;
        self.garbage_bytes = 0;
        Ok(())
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Bytes of live records
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    /// Bytes of superseded records and tombstones
    pub fn garbage_bytes(&self) -> u64 {
        self.garbage_bytes
    }

    /// Current log length
    pub fn file_bytes(&self) -> u64 {
        self.end
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn open(dir: &tempfile::TempDir) -> DiskCollection {
        DiskCollection::open(DiskConfig::at(dir.path())).unwrap()
    }

    #[test]
    fn test_insert_find_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut disk = open(&dir);

        disk.insert(b"k1", b"hello").unwrap();
        assert_eq!(disk.find(b"k1").unwrap(), Some(Bytes::from_static(b"hello")));
        assert!(disk.contains(b"k1"));
        assert_eq!(disk.live_bytes(), 8 + 2 + 5);

        assert!(disk.remove(b"k1").unwrap());
        assert!(!disk.remove(b"k1").unwrap());
        assert_eq!(disk.find(b"k1").unwrap(), None);
        assert!(disk.is_empty());
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let mut disk = open(&dir);

        disk.insert(b"k", b"one").unwrap();
        disk.insert(b"k", b"three").unwrap();
        assert_eq!(disk.find(b"k").unwrap(), Some(Bytes::from_static(b"three")));
        assert_eq!(disk.len(), 1);
        assert_eq!(disk.garbage_bytes(), 8 + 1 + 3);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut disk = open(&dir);
            disk.insert(b"a", b"1").unwrap();
            disk.insert(b"b", b"2").unwrap();
            disk.insert(b"a", b"11").unwrap();
            disk.remove(b"b").unwrap();
        }

        let mut disk = open(&dir);
        assert_eq!(disk.len(), 1);
        assert_eq!(disk.find(b"a").unwrap(), Some(Bytes::from_static(b"11")));
        assert_eq!(disk.find(b"b").unwrap(), None);
        assert_eq!(disk.live_bytes(), 8 + 1 + 2);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut disk = open(&dir);
            disk.insert(b"good", b"value").unwrap();
        }
        let good_len = 8 + 4 + 5;
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join(LOG_FILE))
                .unwrap();
            // header announcing 100 value bytes, followed by only 3
            file.write_all(&3u32.to_le_bytes()).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(b"keyabc").unwrap();
        }

        let mut disk = open(&dir);
        assert_eq!(disk.file_bytes(), good_len);
        assert_eq!(disk.find(b"good").unwrap(), Some(Bytes::from_static(b"value")));
        disk.insert(b"next", b"v").unwrap();

        let mut disk = open(&dir);
        assert_eq!(disk.len(), 2);
        assert_eq!(disk.find(b"next").unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[test]
    fn test_byte_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut disk = DiskCollection::open(DiskConfig {
            max_bytes: 30,
            ..DiskConfig::at(dir.path())
        })
        .unwrap();

        disk.insert(b"a", &[0u8; 10]).unwrap();
        assert_matches!(disk.insert(b"b", &[0u8; 10]), Err(Error::Capacity { .. }));

        // replacing an existing key only counts the difference
        disk.insert(b"a", &[1u8; 12]).unwrap();
    }

    #[test]
    fn test_compaction_reclaims_space() {
        let dir = tempfile::tempdir().unwrap();
        let mut disk = open(&dir);
        for i in 0..20u8 {
            disk.insert(b"churn", &[i; 64]).unwrap();
        }
        disk.insert(b"stable", b"s").unwrap();
        let before = disk.file_bytes();

        disk.compact().unwrap();
        assert!(disk.file_bytes() < before);
        assert_eq!(disk.garbage_bytes(), 0);
        assert_eq!(disk.find(b"churn").unwrap(), Some(Bytes::from(vec![19u8; 64])));
        assert_eq!(disk.find(b"stable").unwrap(), Some(Bytes::from_static(b"s")));

        let mut disk = open(&dir);
        assert_eq!(disk.len(), 2);
        assert_eq!(disk.find(b"stable").unwrap(), Some(Bytes::from_static(b"s")));
    }

    #[test]
    fn test_automatic_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut disk = DiskCollection::open(DiskConfig {
            compaction_threshold: 256,
            ..DiskConfig::at(dir.path())
        })
        .unwrap();

        for i in 0..50u8 {
            disk.insert(b"k", &[i; 32]).unwrap();
        }
        assert!(disk.file_bytes() < 50 * (8 + 1 + 32));
        assert_eq!(disk.find(b"k").unwrap(), Some(Bytes::from(vec![49u8; 32])));
    }
}

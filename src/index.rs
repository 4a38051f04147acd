//! Append-only fixed-record positional index.
//!
//! Every entry is parsed into an [`IndexEntry`] of four fixed-width little
//! endian fields. The whole index lives in memory as a `Vec<IndexEntry>`
//! (entries are tiny and files are append-only, so there's nothing to page
//! in); the file on disk is only consulted on open and flush.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{Result, StoreError};

const MAGIC: &[u8; 11] = b"nestoreidx1";
const VERSION: u8 = 1;
pub const ENTRY_SIZE: u8 = 28;
const FIXED_HEADER_SIZE: u64 = 11 + 1 + 1 + 1 + 4; // magic, newline, version, entry_size, metadata_len

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub number: u64,
    pub position: u64,
    /// On-disk framed size (10-byte length prefix + payload + newline).
    pub size: u64,
    pub partition: u32,
}

impl IndexEntry {
    fn to_bytes(self) -> [u8; ENTRY_SIZE as usize] {
        let mut buf = [0u8; ENTRY_SIZE as usize];
        buf[0..8].copy_from_slice(&self.number.to_le_bytes());
        buf[8..16].copy_from_slice(&self.position.to_le_bytes());
        buf[16..24].copy_from_slice(&self.size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.partition.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            number: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            position: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            size: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            partition: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
        }
    }
}

pub struct Index {
    path: PathBuf,
    file: File,
    header_size: u64,
    entries: Vec<IndexEntry>,
    flushed_count: usize,
    metadata: Value,
    closed: bool,
    on_append: Vec<Box<dyn FnMut(u64, u64) + Send>>,
    on_truncate: Vec<Box<dyn FnMut(u64, u64) + Send>>,
    flush_callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

impl Index {
    pub fn open(path: impl AsRef<Path>, metadata: Option<Value>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        if file_len == 0 {
            let metadata = metadata.unwrap_or(Value::Null);
            let metadata_bytes = serde_json::to_vec(&metadata)
                .map_err(|e| StoreError::InvalidArgument(format!("metadata not serializable: {e}")))?;
            let mut header = Vec::with_capacity(FIXED_HEADER_SIZE as usize + metadata_bytes.len());
            header.extend_from_slice(MAGIC);
            header.push(b'\n');
            header.push(VERSION);
            header.push(ENTRY_SIZE);
            header.extend_from_slice(&(metadata_bytes.len() as u32).to_le_bytes());
            header.extend_from_slice(&metadata_bytes);
            file.write_all(&header)?;
            let header_size = header.len() as u64;
            return Ok(Self {
                path,
                file,
                header_size,
                entries: Vec::new(),
                flushed_count: 0,
                metadata,
                closed: false,
                on_append: Vec::new(),
                on_truncate: Vec::new(),
                flush_callbacks: Vec::new(),
            });
        }

        let mut fixed = [0u8; FIXED_HEADER_SIZE as usize];
        file.read_exact(&mut fixed)?;
        if &fixed[0..11] != MAGIC {
            return Err(StoreError::InvalidHeader {
                path,
                reason: "magic mismatch".to_string(),
            });
        }
        if fixed[11] != b'\n' {
            return Err(StoreError::InvalidHeader {
                path,
                reason: "missing header newline".to_string(),
            });
        }
        let version = fixed[12];
        if version != VERSION {
            return Err(StoreError::VersionMismatch {
                path,
                expected: VERSION,
                actual: version,
            });
        }
        let entry_size = fixed[13];
        if entry_size != ENTRY_SIZE {
            return Err(StoreError::InvalidHeader {
                path,
                reason: format!("entry size mismatch: expected {ENTRY_SIZE}, found {entry_size}"),
            });
        }
        let metadata_len = u32::from_le_bytes(fixed[14..18].try_into().unwrap()) as usize;
        let mut metadata_bytes = vec![0u8; metadata_len];
        file.read_exact(&mut metadata_bytes)?;
        let stored_metadata: Value = serde_json::from_slice(&metadata_bytes).map_err(|e| {
            StoreError::CorruptFile {
                path: path.clone(),
                reason: format!("index metadata is not valid JSON: {e}"),
            }
        })?;

        if let Some(expected) = &metadata {
            let expected_bytes = serde_json::to_vec(expected)
                .map_err(|e| StoreError::InvalidArgument(format!("metadata not serializable: {e}")))?;
            if expected_bytes != metadata_bytes {
                return Err(StoreError::MetadataMismatch { path });
            }
        }

        let header_size = FIXED_HEADER_SIZE + metadata_len as u64;
        let body_len = file_len - header_size;
        if body_len % u64::from(ENTRY_SIZE) != 0 {
            return Err(StoreError::CorruptFile {
                path,
                reason: "index body is not a whole number of entries".to_string(),
            });
        }
        let count = (body_len / u64::from(ENTRY_SIZE)) as usize;
        file.seek(SeekFrom::Start(header_size))?;
        let mut body = vec![0u8; body_len as usize];
        file.read_exact(&mut body)?;
        let mut entries = Vec::with_capacity(count);
        for chunk in body.chunks_exact(ENTRY_SIZE as usize) {
            entries.push(IndexEntry::from_bytes(chunk));
        }

        tracing::debug!(path = ?path, entries = entries.len(), "index opened");

        Ok(Self {
            path,
            file,
            header_size,
            entries,
            flushed_count: count,
            metadata: stored_metadata,
            closed: false,
            on_append: Vec::new(),
            on_truncate: Vec::new(),
            flush_callbacks: Vec::new(),
        })
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn on_append(&mut self, callback: impl FnMut(u64, u64) + Send + 'static) {
        self.on_append.push(Box::new(callback));
    }

    pub fn on_truncate(&mut self, callback: impl FnMut(u64, u64) + Send + 'static) {
        self.on_truncate.push(Box::new(callback));
    }

    /// Appends one entry, returning its new 1-based entry number.
    pub fn add(&mut self, entry: IndexEntry) -> Result<u64> {
        self.add_with_flush_callback(entry, None)
    }

    pub fn add_with_flush_callback(
        &mut self,
        entry: IndexEntry,
        on_flush: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<u64> {
        if self.closed {
            return Err(StoreError::InvalidState("index is closed".to_string()));
        }
        let prev_len = self.len();
        self.entries.push(entry);
        if let Some(cb) = on_flush {
            self.flush_callbacks.push(cb);
        }
        self.notify_append(prev_len, self.len());
        Ok(self.len())
    }

    pub fn get(&self, n: u64) -> Option<IndexEntry> {
        if n == 0 || n > self.len() || self.closed {
            return None;
        }
        self.entries.get((n - 1) as usize).copied()
    }

    /// Inclusive bounds; negative values count from the end (`-1` = last).
    pub fn range(&self, from: i64, to: Option<i64>) -> Option<Vec<IndexEntry>> {
        let length = self.len() as i64;
        let to = to.unwrap_or(length);
        let normalize = |v: i64| -> i64 {
            if v < 0 { length + v + 1 } else { v }
        };
        let from = normalize(from);
        let to = normalize(to);
        if from < 1 || to > length || from > to {
            return None;
        }
        Some(self.entries[(from - 1) as usize..to as usize].to_vec())
    }

    pub fn all(&self) -> Vec<IndexEntry> {
        self.range(1, None).unwrap_or_default()
    }

    /// Binary search by `number`: returns `0` if `key` precedes the first
    /// entry (or the index is empty), `length` if it is at or past the
    /// last entry's key, otherwise the largest `n` with
    /// `entries[n].number <= key`.
    pub fn find(&self, key: u64) -> u64 {
        if self.entries.is_empty() {
            return 0;
        }
        if key < self.entries[0].number {
            return 0;
        }
        if key >= self.entries[self.entries.len() - 1].number {
            return self.len();
        }
        let (mut lo, mut hi) = (0usize, self.entries.len() - 1);
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if self.entries[mid].number <= key {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        (lo + 1) as u64
    }

    /// Picks up entries appended to the file by another process since this
    /// index was opened or last reloaded. Single-writer/multi-reader: a
    /// read-only instance never sees its own in-memory entries shrink, so
    /// this only ever grows `entries`, never re-validates the header.
    pub fn reload(&mut self) -> Result<()> {
        if self.closed {
            return Err(StoreError::InvalidState("index is closed".to_string()));
        }
        let file_len = self.file.metadata()?.len();
        if file_len <= self.header_size {
            return Ok(());
        }
        let body_len = file_len - self.header_size;
        if body_len % u64::from(ENTRY_SIZE) != 0 {
            return Err(StoreError::CorruptFile {
                path: self.path.clone(),
                reason: "index body is not a whole number of entries".to_string(),
            });
        }
        let count = (body_len / u64::from(ENTRY_SIZE)) as usize;
        if count <= self.entries.len() {
            return Ok(());
        }
        let new_bytes = (count - self.entries.len()) * ENTRY_SIZE as usize;
        self.file.seek(SeekFrom::Start(
            self.header_size + (self.entries.len() as u64) * u64::from(ENTRY_SIZE),
        ))?;
        let mut buf = vec![0u8; new_bytes];
        self.file.read_exact(&mut buf)?;
        let prev_len = self.len();
        for chunk in buf.chunks_exact(ENTRY_SIZE as usize) {
            self.entries.push(IndexEntry::from_bytes(chunk));
        }
        self.flushed_count = self.entries.len();
        self.notify_append(prev_len, self.len());
        Ok(())
    }

    pub fn truncate(&mut self, after_n: u64) -> Result<()> {
        if after_n >= self.len() {
            return Ok(());
        }
        self.flush()?;
        let prev_len = self.len();
        self.entries.truncate(after_n as usize);
        self.file.set_len(self.header_size + after_n * u64::from(ENTRY_SIZE))?;
        self.flushed_count = after_n as usize;
        self.notify_truncate(prev_len, after_n);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.flushed_count < self.entries.len() {
            self.file.seek(SeekFrom::Start(
                self.header_size + (self.flushed_count as u64) * u64::from(ENTRY_SIZE),
            ))?;
            for entry in &self.entries[self.flushed_count..] {
                self.file.write_all(&entry.to_bytes())?;
            }
            self.flushed_count = self.entries.len();
        }
        for cb in self.flush_callbacks.drain(..) {
            cb();
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        Ok(())
    }

    fn notify_append(&mut self, prev_len: u64, new_len: u64) {
        for cb in &mut self.on_append {
            cb(prev_len, new_len);
        }
    }

    fn notify_truncate(&mut self, prev_len: u64, new_len: u64) {
        for cb in &mut self.on_truncate {
            cb(prev_len, new_len);
        }
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(error) = self.flush() {
                tracing::error!(path = ?self.path, %error, "failed to flush index on drop");
            }
        }
    }
}

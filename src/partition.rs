//! Append-only byte-level segment file.
//!
//! A partition stores a contiguous sequence of length-prefixed documents
//! behind a small magic-byte header. Writes are buffered and flushed as a
//! batch; reads are served from the write buffer, a read-ahead cache, or a
//! direct one-shot read, in that order.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::{Result, StoreError};

/// First seven bytes of the partition magic; the eighth byte is the format
/// version, so a version bump and a bad file can be told apart on open.
const MAGIC_PREFIX: &[u8; 7] = b"nesprt0";
const VERSION: u8 = b'1';
const HEADER_SIZE: u64 = 9; // 8-byte magic + newline
const LEN_WIDTH: usize = 10;
const FRAME_OVERHEAD: u64 = (LEN_WIDTH as u64) + 1; // length prefix + trailing newline

pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096 + LEN_WIDTH;
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// `djb2-xor`: a cheap, stable 32-bit hash used to derive partition ids from
/// their names.
pub fn hash32(name: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in name.bytes() {
        hash = hash.wrapping_shl(5).wrapping_add(hash) ^ u32::from(byte);
    }
    hash
}

struct ReadCache {
    base: u64,
    data: Vec<u8>,
    capacity: usize,
}

impl ReadCache {
    fn new(capacity: usize) -> Self {
        Self { base: 0, data: Vec::new(), capacity }
    }

    fn covers(&self, position: u64, len: u64) -> bool {
        !self.data.is_empty()
            && position >= self.base
            && position + len <= self.base + self.data.len() as u64
    }

    fn slice(&self, position: u64, len: u64) -> &[u8] {
        let start = (position - self.base) as usize;
        &self.data[start..start + len as usize]
    }
}

pub struct Partition {
    path: PathBuf,
    file: File,
    id: u32,
    /// Logical body size: bytes written so far, flushed or not.
    size: u64,
    /// Byte offset (into the body) at which the write buffer begins.
    write_base: u64,
    write_buf: Vec<u8>,
    write_buf_capacity: usize,
    buffered_documents: usize,
    max_write_buffer_documents: usize,
    read_cache: ReadCache,
    pending_flush: bool,
    sync_on_flush: bool,
    flush_callbacks: Vec<Box<dyn FnOnce() + Send>>,
    on_append: Vec<Box<dyn FnMut(u64, u64) + Send>>,
    on_truncate: Vec<Box<dyn FnMut(u64, u64) + Send>>,
    closed: bool,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("path", &self.path)
            .field("id", &self.id)
            .field("size", &self.size)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Partition {
    pub fn open(path: impl AsRef<Path>, name: &str) -> Result<Self> {
        Self::open_with_buffers(
            path,
            name,
            DEFAULT_READ_BUFFER_SIZE,
            DEFAULT_WRITE_BUFFER_SIZE,
        )
    }

    pub fn open_with_buffers(
        path: impl AsRef<Path>,
        name: &str,
        read_buffer_size: usize,
        write_buffer_size: usize,
    ) -> Result<Self> {
        Self::open_impl(path, name, read_buffer_size, write_buffer_size, false).map(|(p, _)| p)
    }

    /// Like [`Self::open_with_buffers`], but additionally scans backward
    /// from the tail for the last complete document and truncates a torn
    /// suffix left behind by a crash mid-write. Returns the number of bytes
    /// discarded (`0` if the tail was already intact).
    pub fn open_with_recovery(
        path: impl AsRef<Path>,
        name: &str,
        read_buffer_size: usize,
        write_buffer_size: usize,
    ) -> Result<(Self, u64)> {
        Self::open_impl(path, name, read_buffer_size, write_buffer_size, true)
    }

    fn open_impl(
        path: impl AsRef<Path>,
        name: &str,
        read_buffer_size: usize,
        write_buffer_size: usize,
        recover: bool,
    ) -> Result<(Self, u64)> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let mut size = if file_len == 0 {
            let mut header = [0u8; HEADER_SIZE as usize];
            header[..7].copy_from_slice(MAGIC_PREFIX);
            header[7] = VERSION;
            header[8] = b'\n';
            file.write_all(&header)?;
            0
        } else {
            let mut header = [0u8; HEADER_SIZE as usize];
            file.read_exact(&mut header)?;
            if &header[..7] != MAGIC_PREFIX {
                return Err(StoreError::InvalidHeader {
                    path,
                    reason: "magic prefix mismatch".to_string(),
                });
            }
            if header[7] != VERSION {
                return Err(StoreError::VersionMismatch {
                    path,
                    expected: VERSION,
                    actual: header[7],
                });
            }
            if header[8] != b'\n' {
                return Err(StoreError::InvalidHeader {
                    path,
                    reason: "missing header newline".to_string(),
                });
            }
            file_len - HEADER_SIZE
        };

        let mut discarded = 0u64;
        if recover && size > 0 {
            file.seek(SeekFrom::Start(HEADER_SIZE))?;
            let mut body = vec![0u8; size as usize];
            file.read_exact(&mut body)?;
            let valid = scan_valid_len(&body);
            if valid < size {
                discarded = size - valid;
                file.set_len(HEADER_SIZE + valid)?;
                size = valid;
                tracing::warn!(partition = name, discarded, "torn write recovered, truncated tail");
            }
        }

        tracing::debug!(partition = name, size, "partition opened");

        Ok((
            Self {
                id: hash32(name),
                path,
                file,
                size,
                write_base: size,
                write_buf: Vec::with_capacity(write_buffer_size),
                write_buf_capacity: write_buffer_size,
                buffered_documents: 0,
                max_write_buffer_documents: 0,
                read_cache: ReadCache::new(read_buffer_size),
                pending_flush: false,
                sync_on_flush: false,
                flush_callbacks: Vec::new(),
                on_append: Vec::new(),
                on_truncate: Vec::new(),
                closed: false,
            },
            discarded,
        ))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_sync_on_flush(&mut self, sync: bool) {
        self.sync_on_flush = sync;
    }

    pub fn set_max_write_buffer_documents(&mut self, max: usize) {
        self.max_write_buffer_documents = max;
    }

    pub fn on_append(&mut self, callback: impl FnMut(u64, u64) + Send + 'static) {
        self.on_append.push(Box::new(callback));
    }

    pub fn on_truncate(&mut self, callback: impl FnMut(u64, u64) + Send + 'static) {
        self.on_truncate.push(Box::new(callback));
    }

    /// Appends `data`, returning the byte position it was written at.
    pub fn write(&mut self, data: &[u8]) -> Result<u64> {
        self.write_with_flush_callback(data, None)
    }

    pub fn write_with_flush_callback(
        &mut self,
        data: &[u8],
        on_flush: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<u64> {
        if self.closed {
            return Err(StoreError::InvalidState("partition is closed".to_string()));
        }
        let n = data.len() as u64;
        let total = n + FRAME_OVERHEAD;
        let position = self.size;

        if self.write_buf.len() + total as usize > self.write_buf_capacity && !self.write_buf.is_empty() {
            self.flush()?;
        }

        if total as usize > self.write_buf_capacity {
            // Bypasses buffering entirely; written straight through.
            self.flush()?;
            let framed = Self::frame(data);
            self.file.seek(SeekFrom::Start(HEADER_SIZE + self.size))?;
            self.file.write_all(&framed)?;
            self.write_base += total;
            if let Some(cb) = on_flush {
                self.flush_callbacks.push(cb);
            }
            self.run_flush_callbacks();
        } else {
            let was_empty = self.write_buf.is_empty();
            self.write_buf.extend_from_slice(&Self::frame(data));
            self.buffered_documents += 1;
            if let Some(cb) = on_flush {
                self.flush_callbacks.push(cb);
            }
            if was_empty {
                self.pending_flush = true;
            }
            if self.max_write_buffer_documents > 0
                && self.buffered_documents >= self.max_write_buffer_documents
            {
                self.flush()?;
            }
        }

        self.size += total;
        self.notify_append(position, self.size);
        Ok(position)
    }

    fn frame(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + FRAME_OVERHEAD as usize);
        out.extend_from_slice(format!("{:<width$}", data.len(), width = LEN_WIDTH).as_bytes());
        out.extend_from_slice(data);
        out.push(b'\n');
        out
    }

    /// Reads the document at `position`, validating against `expected_size`
    /// (the payload length) when given. Returns `None` past the end, to
    /// match the contract's "end of data returns false" policy.
    pub fn read_from(&mut self, position: u64, expected_size: Option<u64>) -> Result<Option<Bytes>> {
        if self.closed {
            return Ok(None);
        }
        if position + (LEN_WIDTH as u64) >= self.size {
            return Ok(None);
        }

        let header = self.read_exact_at(position, LEN_WIDTH as u64)?;
        let length = parse_length(&header, position, &self.path)?;

        if let Some(expected) = expected_size {
            if expected != length {
                return Err(StoreError::InvalidDataSize {
                    path: self.path.clone(),
                    position,
                    expected,
                    actual: length,
                });
            }
        }

        if position + length + FRAME_OVERHEAD > self.size {
            return Err(StoreError::CorruptFile {
                path: self.path.clone(),
                reason: format!("torn write at position {position}"),
            });
        }

        let payload = self.read_exact_at(position + LEN_WIDTH as u64, length)?;
        Ok(Some(Bytes::from(payload)))
    }

    fn read_exact_at(&mut self, position: u64, len: u64) -> Result<Vec<u8>> {
        if position >= self.write_base {
            let start = (position - self.write_base) as usize;
            return Ok(self.write_buf[start..start + len as usize].to_vec());
        }
        if position + len <= self.write_base {
            if self.read_cache.covers(position, len) {
                return Ok(self.read_cache.slice(position, len).to_vec());
            }
            self.refill_read_cache(position)?;
            if self.read_cache.covers(position, len) {
                return Ok(self.read_cache.slice(position, len).to_vec());
            }
            // Larger than the cache: one-shot direct read.
            let mut buf = vec![0u8; len as usize];
            self.file.seek(SeekFrom::Start(HEADER_SIZE + position))?;
            self.file.read_exact(&mut buf)?;
            return Ok(buf);
        }
        // Straddles the flushed/buffered boundary.
        let flushed_len = (self.write_base - position) as usize;
        let mut out = vec![0u8; len as usize];
        let flushed_part = self.read_exact_at(position, flushed_len as u64)?;
        out[..flushed_len].copy_from_slice(&flushed_part);
        let buffered_part = &self.write_buf[..len as usize - flushed_len];
        out[flushed_len..].copy_from_slice(buffered_part);
        Ok(out)
    }

    fn refill_read_cache(&mut self, position: u64) -> Result<()> {
        let capacity = self.read_cache.capacity as u64;
        let readable = self.write_base.saturating_sub(position).min(capacity);
        let mut buf = vec![0u8; readable as usize];
        self.file.seek(SeekFrom::Start(HEADER_SIZE + position))?;
        self.file.read_exact(&mut buf)?;
        self.read_cache.base = position;
        self.read_cache.data = buf;
        Ok(())
    }

    /// Lazily yields every document in order, stopping at the first gap.
    pub fn read_all(&mut self) -> PartitionIter<'_> {
        PartitionIter { partition: self, position: 0 }
    }

    pub fn truncate(&mut self, after: u64) -> Result<()> {
        if after >= self.size {
            return Ok(());
        }
        self.flush()?;
        let prev_size = self.size;
        self.file.set_len(HEADER_SIZE + after)?;
        self.size = after;
        self.write_base = after;
        self.read_cache = ReadCache::new(self.read_cache.capacity);
        self.notify_truncate(prev_size, after);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.write_buf.is_empty() {
            self.file.seek(SeekFrom::Start(HEADER_SIZE + self.write_base))?;
            self.file.write_all(&self.write_buf)?;
            self.write_base += self.write_buf.len() as u64;
            self.write_buf.clear();
            self.buffered_documents = 0;
        }
        if self.sync_on_flush {
            self.file.sync_data()?;
        }
        self.pending_flush = false;
        self.run_flush_callbacks();
        Ok(())
    }

    fn run_flush_callbacks(&mut self) {
        for cb in self.flush_callbacks.drain(..) {
            cb();
        }
    }

    fn notify_append(&mut self, prev_size: u64, new_size: u64) {
        for cb in &mut self.on_append {
            cb(prev_size, new_size);
        }
    }

    fn notify_truncate(&mut self, prev_size: u64, new_size: u64) {
        for cb in &mut self.on_truncate {
            cb(prev_size, new_size);
        }
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(error) = self.flush() {
                tracing::error!(partition = ?self.path, %error, "failed to flush partition on drop");
            }
        }
    }
}

pub struct PartitionIter<'a> {
    partition: &'a mut Partition,
    position: u64,
}

impl<'a> Iterator for PartitionIter<'a> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.partition.read_from(self.position, None) {
            Ok(Some(data)) => {
                self.position += data.len() as u64 + FRAME_OVERHEAD;
                Some(Ok(data))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Walks a partition body frame by frame from the start, stopping at the
/// first header that doesn't parse, the first frame that runs past `body`,
/// or a missing trailing newline. Returns the offset of the last complete
/// frame, i.e. the length the body should be truncated to.
fn scan_valid_len(body: &[u8]) -> u64 {
    let mut offset = 0usize;
    while offset + LEN_WIDTH <= body.len() {
        let header = &body[offset..offset + LEN_WIDTH];
        let Ok(text) = std::str::from_utf8(header) else { break };
        let trimmed = text.trim_end_matches(' ');
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            break;
        }
        let Ok(length) = trimmed.parse::<u64>() else { break };
        let frame_total = LEN_WIDTH as u64 + length + 1;
        let end = offset as u64 + frame_total;
        if end > body.len() as u64 {
            break;
        }
        if body[(end - 1) as usize] != b'\n' {
            break;
        }
        offset = end as usize;
    }
    offset as u64
}

fn parse_length(header: &[u8], position: u64, path: &Path) -> Result<u64> {
    let text = std::str::from_utf8(header).map_err(|_| StoreError::CorruptFile {
        path: path.to_path_buf(),
        reason: format!("non-ASCII length prefix at position {position}"),
    })?;
    let trimmed = text.trim_end_matches(' ');
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(StoreError::CorruptFile {
            path: path.to_path_buf(),
            reason: format!("invalid length prefix {text:?} at position {position}"),
        });
    }
    trimmed.parse::<u64>().map_err(|_| StoreError::CorruptFile {
        path: path.to_path_buf(),
        reason: format!("length prefix overflow at position {position}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_back() {
        let dir = tempdir().unwrap();
        let mut p = Partition::open(dir.path().join("test.part"), "test").unwrap();
        let pos = p.write(b"hello").unwrap();
        assert_eq!(pos, 0);
        p.flush().unwrap();
        let data = p.read_from(pos, None).unwrap().unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[test]
    fn read_from_past_end_returns_none() {
        let dir = tempdir().unwrap();
        let mut p = Partition::open(dir.path().join("test.part"), "test").unwrap();
        p.write(b"hello").unwrap();
        assert!(p.read_from(1000, None).unwrap().is_none());
    }

    #[test]
    fn expected_size_mismatch_errors() {
        let dir = tempdir().unwrap();
        let mut p = Partition::open(dir.path().join("test.part"), "test").unwrap();
        let pos = p.write(b"hello").unwrap();
        p.flush().unwrap();
        let err = p.read_from(pos, Some(3)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDataSize { .. }));
    }

    #[test]
    fn reopen_preserves_size_and_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.part");
        {
            let mut p = Partition::open(&path, "test").unwrap();
            p.write(b"one").unwrap();
            p.write(b"two").unwrap();
            p.close().unwrap();
        }
        let p = Partition::open(&path, "test").unwrap();
        assert_eq!(p.size(), (3 + FRAME_OVERHEAD) + (3 + FRAME_OVERHEAD));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.part");
        std::fs::write(&path, b"bogusmagic\n").unwrap();
        let err = Partition::open(&path, "test").unwrap_err();
        assert!(matches!(err, StoreError::InvalidHeader { .. }));
    }

    #[test]
    fn truncate_then_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.part");
        let mut p = Partition::open(&path, "test").unwrap();
        let first = p.write(b"one").unwrap();
        p.write(b"two").unwrap();
        p.flush().unwrap();
        p.truncate(first).unwrap();
        assert_eq!(p.size(), first);
        assert!(p.read_from(first, None).unwrap().is_none());
    }

    #[test]
    fn read_all_yields_documents_in_order() {
        let dir = tempdir().unwrap();
        let mut p = Partition::open(dir.path().join("test.part"), "test").unwrap();
        p.write(b"a").unwrap();
        p.write(b"bb").unwrap();
        p.write(b"ccc").unwrap();
        p.flush().unwrap();
        let docs: Vec<Vec<u8>> = p.read_all().map(|r| r.unwrap().to_vec()).collect();
        assert_eq!(docs, vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);
    }

    #[test]
    fn hash32_is_stable() {
        assert_eq!(hash32("foo"), hash32("foo"));
        assert_ne!(hash32("foo"), hash32("bar"));
    }

    #[test]
    fn read_from_closed_partition_returns_none() {
        let dir = tempdir().unwrap();
        let mut p = Partition::open(dir.path().join("test.part"), "test").unwrap();
        let pos = p.write(b"hello").unwrap();
        p.close().unwrap();
        assert!(p.read_from(pos, None).unwrap().is_none());
    }

    #[test]
    fn recovery_truncates_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.part");
        let good_len;
        {
            let mut p = Partition::open(&path, "test").unwrap();
            p.write(b"one").unwrap();
            p.write(b"two").unwrap();
            p.flush().unwrap();
            good_len = p.size();
        }
        // Simulate a crash mid-write: append a partial frame (length prefix
        // claiming more bytes than follow, no trailing newline).
        {
            use std::io::Write as _;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"0000000020partial").unwrap();
        }

        let (p, discarded) =
            Partition::open_with_recovery(&path, "test", DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_BUFFER_SIZE)
                .unwrap();
        assert_eq!(p.size(), good_len);
        assert_eq!(discarded, 18);
    }

    #[test]
    fn recovery_is_a_no_op_on_intact_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.part");
        {
            let mut p = Partition::open(&path, "test").unwrap();
            p.write(b"one").unwrap();
            p.flush().unwrap();
        }
        let (p, discarded) =
            Partition::open_with_recovery(&path, "test", DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_BUFFER_SIZE)
                .unwrap();
        assert_eq!(discarded, 0);
        assert_eq!(p.size(), 3 + FRAME_OVERHEAD);
    }
}

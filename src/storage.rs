//! Storage coordinator: composes partitions and indexes into write streams
//! and read streams, and the `EventStore` specialization that layers
//! optimistic concurrency, commit identifiers, and stream creation on top.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::index::{Index, IndexEntry};
use crate::matcher::{self, Matcher, StreamCatalogEntry};
use crate::partition::Partition;
use crate::codec::{JsonSerializer, Serializer};
use crate::watch::DirectoryWatcher;

/// Tunables that spec.md names inline rather than through a config loader.
pub struct StorageOptions {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_write_buffer_documents: usize,
    pub sync_on_flush: bool,
    pub dirty_reads: bool,
    pub hmac_secret: Option<Vec<u8>>,
    pub serializer: Box<dyn Serializer>,
    /// If a `.lock` file is already present when `EventStore::open` is
    /// called (the previous writer crashed without releasing it), scan
    /// every known partition for a torn tail left by that crash and rebuild
    /// the primary/secondary indexes to match. See spec.md §4.1.
    pub reclaim_stale_lock: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: crate::partition::DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: crate::partition::DEFAULT_WRITE_BUFFER_SIZE,
            max_write_buffer_documents: 0,
            sync_on_flush: false,
            dirty_reads: true,
            hmac_secret: None,
            serializer: Box::new(JsonSerializer),
            reclaim_stale_lock: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ExpectedVersion {
    Exact(u64),
    Any,
    EmptyStream,
}

#[derive(Debug, Clone)]
pub struct CommitResult {
    pub commit_id: Uuid,
    pub committed_at: DateTime<Utc>,
    pub first_seq: u64,
    pub last_seq: u64,
}

/// Read access to committed documents by index entry, shared between
/// `EventStore`, `EventStream`, and `Consumer`.
pub trait DocumentReader {
    fn read_document(&mut self, entry: &IndexEntry) -> Result<Value>;
}

struct SecondaryStream {
    index: Index,
    matcher: Matcher,
    write_partition: Option<String>,
}

enum Mode {
    Writable { lock: fslock::LockFile, lock_path: PathBuf },
    ReadOnly { watcher: Option<DirectoryWatcher> },
}

pub struct EventStore {
    data_dir: PathBuf,
    storage_name: String,
    options: StorageOptions,
    partitions: HashMap<String, Partition>,
    partition_names: HashMap<u32, String>,
    partition_versions: HashMap<u32, u64>,
    primary_index: Index,
    secondary: HashMap<String, SecondaryStream>,
    mode: Mode,
    on_wrote: Vec<Box<dyn FnMut(&Value, &IndexEntry) + Send>>,
    on_index_add: Vec<Box<dyn FnMut(&str, u64, &Value) + Send>>,
    closed: bool,
}

impl EventStore {
    pub fn open(data_dir: impl AsRef<Path>, storage_name: &str, options: StorageOptions) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        let lock_path = data_dir.join(format!("{storage_name}.lock"));
        let lock_preexisted = lock_path.exists();
        let mut lock = fslock::LockFile::open(&lock_path)
            .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))?;
        let acquired = lock
            .try_lock()
            .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))?;
        if !acquired {
            return Err(StoreError::LockHeld { path: lock_path });
        }
        let reclaim = lock_preexisted && options.reclaim_stale_lock;
        if reclaim {
            tracing::warn!(storage = storage_name, "reclaiming stale lock, scanning for torn writes");
        }
        Self::open_inner(
            data_dir,
            storage_name,
            options,
            Mode::Writable { lock, lock_path },
            reclaim,
        )
    }

    pub fn open_read_only(data_dir: impl AsRef<Path>, storage_name: &str, options: StorageOptions) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let watcher = DirectoryWatcher::new(&data_dir).ok();
        Self::open_inner(data_dir, storage_name, options, Mode::ReadOnly { watcher }, false)
    }

    fn open_inner(
        data_dir: PathBuf,
        storage_name: &str,
        options: StorageOptions,
        mode: Mode,
        reclaim: bool,
    ) -> Result<Self> {
        let primary_path = data_dir.join(format!("{storage_name}.primary.index"));
        let primary_index = Index::open(&primary_path, None)?;

        let mut store = Self {
            data_dir,
            storage_name: storage_name.to_string(),
            options,
            partitions: HashMap::new(),
            partition_names: HashMap::new(),
            partition_versions: HashMap::new(),
            primary_index,
            secondary: HashMap::new(),
            mode,
            on_wrote: Vec::new(),
            on_index_add: Vec::new(),
            closed: false,
        };

        store.load_catalog()?;
        if reclaim {
            store.recover_torn_writes()?;
        }
        store.rebuild_partition_versions();
        Ok(store)
    }

    fn rebuild_partition_versions(&mut self) {
        let mut versions: HashMap<u32, u64> = HashMap::new();
        for n in 1..=self.primary_index.len() {
            let entry = self.primary_index.get(n).expect("entry within range");
            *versions.entry(entry.partition).or_insert(0) += 1;
        }
        self.partition_versions = versions;
    }

    /// Scans every partition known from the catalog for a torn tail left by
    /// a crashed writer, truncates it, and drops any primary/secondary
    /// index entries that referred to the discarded bytes. See spec.md
    /// §4.1's "Torn-write recovery (open path)".
    fn recover_torn_writes(&mut self) -> Result<()> {
        let names: Vec<String> = self.partition_names.values().cloned().collect();
        let mut recovered_size: HashMap<u32, u64> = HashMap::new();
        for name in &names {
            let path = self.partition_path(name);
            if !path.exists() {
                continue;
            }
            let (partition, _discarded) = Partition::open_with_recovery(
                &path,
                name,
                self.options.read_buffer_size,
                self.options.write_buffer_size,
            )?;
            recovered_size.insert(partition.id(), partition.size());
            self.partitions.insert(name.clone(), partition);
        }
        if recovered_size.is_empty() {
            return Ok(());
        }

        let all = self.primary_index.all();
        let mut valid_len = all.len();
        while valid_len > 0 {
            let candidate = &all[valid_len - 1];
            let intact = match recovered_size.get(&candidate.partition) {
                Some(&size) => candidate.position + candidate.size <= size,
                None => true,
            };
            if intact {
                break;
            }
            valid_len -= 1;
        }
        let valid_len = valid_len as u64;

        if valid_len < all.len() as u64 {
            let max_valid_number = if valid_len == 0 { 0 } else { all[(valid_len - 1) as usize].number };
            self.primary_index.truncate(valid_len)?;
            for stream in self.secondary.values_mut() {
                let keep = stream.index.find(max_valid_number);
                stream.index.truncate(keep)?;
            }
            tracing::warn!(
                valid_len,
                discarded_entries = all.len() as u64 - valid_len,
                "primary index truncated after torn-write recovery"
            );
        }
        Ok(())
    }

    fn catalog_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.streams", self.storage_name))
    }

    fn load_catalog(&mut self) -> Result<()> {
        let path = self.catalog_path();
        if !path.exists() {
            return Ok(());
        }
        let bytes = fs::read(&path)?;
        let entries: Vec<StreamCatalogEntry> = serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::CorruptFile { path: path.clone(), reason: format!("invalid catalog JSON: {e}") }
        })?;
        for entry in entries {
            // Already tracked (e.g. a read-only store's refresh() re-reading
            // the catalog after `load_catalog` already loaded it on open) —
            // it's kept in sync incrementally via `Index::reload`, not by
            // reopening the file from scratch here.
            if self.secondary.contains_key(&entry.stream_name) {
                continue;
            }
            matcher::verify_entry(&entry, self.options.hmac_secret.as_deref())?;
            let matcher = match matcher::matcher_from_entry(&entry)? {
                Some(matcher) => matcher,
                None => {
                    tracing::warn!(
                        stream = %entry.stream_name,
                        "predicate stream cannot be restored on reopen without its closure, skipping"
                    );
                    continue;
                }
            };
            if let (Matcher::WritePartition(id), Some(name)) = (&matcher, &entry.write_partition) {
                self.partition_names.insert(*id, name.clone());
            }
            let index_path = self
                .data_dir
                .join(format!("{}.{}.index", self.storage_name, entry.stream_name));
            let index = Index::open(&index_path, None)?;
            self.secondary.insert(
                entry.stream_name.clone(),
                SecondaryStream { index, matcher, write_partition: entry.write_partition },
            );
        }
        Ok(())
    }

    fn save_catalog(&self) -> Result<()> {
        let entries: Vec<StreamCatalogEntry> = self
            .secondary
            .iter()
            .filter_map(|(name, stream)| {
                matcher::persist_entry(
                    name,
                    &stream.matcher,
                    stream.write_partition.clone(),
                    self.options.hmac_secret.as_deref(),
                )
                .ok()
            })
            .collect();
        let bytes = serde_json::to_vec_pretty(&entries)
            .map_err(|e| StoreError::InvalidArgument(format!("catalog not serializable: {e}")))?;
        let tmp = self.catalog_path().with_extension("streams.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.catalog_path())?;
        Ok(())
    }

    fn partition_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.{}", self.storage_name, name))
    }

    fn ensure_partition(&mut self, name: &str) -> Result<u32> {
        if let Some(partition) = self.partitions.get(name) {
            return Ok(partition.id());
        }
        if let Some(existing) = self.secondary.get(name) {
            if !matches!(existing.matcher, Matcher::WritePartition(_)) {
                return Err(StoreError::StreamExists { name: name.to_string() });
            }
        }
        let mut partition = Partition::open_with_buffers(
            self.partition_path(name),
            name,
            self.options.read_buffer_size,
            self.options.write_buffer_size,
        )?;
        partition.set_sync_on_flush(self.options.sync_on_flush);
        partition.set_max_write_buffer_documents(self.options.max_write_buffer_documents);
        let id = partition.id();
        self.partitions.insert(name.to_string(), partition);
        self.partition_names.insert(id, name.to_string());
        tracing::info!(partition = name, id, "partition created");

        if !self.secondary.contains_key(name) {
            // Every write stream implicitly has a same-named read stream
            // whose matcher is "documents in partition p" (spec.md §3).
            let index_path = self.data_dir.join(format!("{}.{}.index", self.storage_name, name));
            let index = Index::open(&index_path, None)?;
            self.secondary.insert(
                name.to_string(),
                SecondaryStream {
                    index,
                    matcher: Matcher::WritePartition(id),
                    write_partition: Some(name.to_string()),
                },
            );
            self.save_catalog()?;
        }
        Ok(id)
    }

    fn current_version(&self, partition_id: u32) -> u64 {
        self.partition_versions.get(&partition_id).copied().unwrap_or(0)
    }

    /// Appends `events` to `write_stream` as a single commit.
    pub fn commit(
        &mut self,
        write_stream: &str,
        events: Vec<Value>,
        expected_version: ExpectedVersion,
        commit_metadata: Option<Value>,
    ) -> Result<CommitResult> {
        if self.closed {
            return Err(StoreError::InvalidState("event store is closed".to_string()));
        }
        let Mode::Writable { .. } = &self.mode else {
            return Err(StoreError::InvalidState("store is read-only".to_string()));
        };
        if events.is_empty() {
            return Err(StoreError::InvalidArgument("commit requires at least one event".to_string()));
        }

        let partition_id = self.ensure_partition(write_stream)?;
        let current_version = self.current_version(partition_id);

        match expected_version {
            ExpectedVersion::Exact(expected) if expected != current_version => {
                return Err(StoreError::OptimisticConcurrency {
                    stream: write_stream.to_string(),
                    expected,
                    actual: current_version,
                });
            }
            ExpectedVersion::EmptyStream if current_version != 0 => {
                return Err(StoreError::OptimisticConcurrency {
                    stream: write_stream.to_string(),
                    expected: 0,
                    actual: current_version,
                });
            }
            _ => {}
        }

        let commit_id = Uuid::new_v4();
        let committed_at = Utc::now();
        let commit_size = events.len() as u64;
        let mut first_seq = None;
        let mut last_seq = 0;
        let mut wrote_notifications = Vec::with_capacity(events.len());
        let mut index_add_notifications: Vec<(String, u64, Value)> = Vec::new();

        for (k, event) in events.into_iter().enumerate() {
            let mut metadata = json!({
                "commitId": commit_id.to_string(),
                "committedAt": committed_at.to_rfc3339(),
                "commitVersion": k,
                "commitSize": commit_size,
                "streamVersion": current_version + k as u64 + 1,
            });
            if let Some(extra) = &commit_metadata {
                if let (Value::Object(base), Value::Object(extra)) = (&mut metadata, extra) {
                    for (key, value) in extra {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
            let wrapped = json!({ "payload": event, "metadata": metadata });
            let serialized = self.options.serializer.serialize(&wrapped)?;

            let partition = self.partitions.get_mut(write_stream).expect("just ensured");
            let position = partition.write(&serialized)?;
            let framed_size = serialized.len() as u64 + 11;

            let seq = self.primary_index.len() + 1;
            let primary_entry = IndexEntry { number: seq, position, size: framed_size, partition: partition_id };
            self.primary_index.add(primary_entry)?;

            // The write stream's own implicit read stream gets every
            // document unconditionally; content matchers never see it.
            if let Some(stream) = self.secondary.get_mut(write_stream) {
                if matches!(stream.matcher, Matcher::WritePartition(_)) {
                    let new_len = stream.index.add(primary_entry)?;
                    index_add_notifications.push((write_stream.to_string(), new_len, wrapped.clone()));
                }
            }

            for (name, stream) in &mut self.secondary {
                if name == write_stream {
                    continue;
                }
                if stream.matcher.matches(&wrapped) {
                    let new_len = stream.index.add(primary_entry)?;
                    index_add_notifications.push((name.clone(), new_len, wrapped.clone()));
                }
            }

            first_seq.get_or_insert(seq);
            last_seq = seq;
            wrote_notifications.push((wrapped, primary_entry));
        }

        self.partitions.get_mut(write_stream).expect("just ensured").flush()?;
        self.primary_index.flush()?;
        for stream in self.secondary.values_mut() {
            stream.index.flush()?;
        }
        *self.partition_versions.entry(partition_id).or_insert(0) += commit_size;

        for (doc, entry) in &wrote_notifications {
            for cb in &mut self.on_wrote {
                cb(doc, entry);
            }
        }
        for (name, new_len, doc) in &index_add_notifications {
            for cb in &mut self.on_index_add {
                cb(name, *new_len, doc);
            }
        }

        tracing::info!(
            stream = write_stream,
            %commit_id,
            first_seq,
            last_seq,
            "commit applied"
        );

        Ok(CommitResult {
            commit_id,
            committed_at,
            first_seq: first_seq.unwrap_or(0),
            last_seq,
        })
    }

    /// Creates a secondary index over events matching `matcher`, replaying
    /// the primary index from entry 1.
    pub fn create_stream(&mut self, name: &str, matcher: Matcher) -> Result<()> {
        if self.secondary.contains_key(name) || self.partitions.contains_key(name) {
            return Err(StoreError::StreamExists { name: name.to_string() });
        }
        let index_path = self.data_dir.join(format!("{}.{}.index", self.storage_name, name));
        let mut index = Index::open(&index_path, None)?;

        for n in 1..=self.primary_index.len() {
            let entry = self.primary_index.get(n).expect("entry within range");
            let document = self.read_entry(&entry)?;
            if matcher.matches(&document) {
                index.add(entry)?;
            }
        }
        index.flush()?;

        self.secondary.insert(
            name.to_string(),
            SecondaryStream { index, matcher, write_partition: None },
        );
        self.save_catalog()?;
        tracing::info!(stream = name, "stream created");
        Ok(())
    }

    fn read_entry(&mut self, entry: &IndexEntry) -> Result<Value> {
        let name = self
            .partition_names
            .get(&entry.partition)
            .cloned()
            .ok_or_else(|| StoreError::CorruptFile {
                path: self.data_dir.clone(),
                reason: format!("no partition registered for id {}", entry.partition),
            })?;
        if !self.partitions.contains_key(&name) {
            // A read-only store (or a reader that hasn't written to this
            // partition in-session) never runs `ensure_partition`, but can
            // still be asked to read documents from it.
            let partition = Partition::open_with_buffers(
                self.partition_path(&name),
                &name,
                self.options.read_buffer_size,
                self.options.write_buffer_size,
            )?;
            self.partitions.insert(name.clone(), partition);
        }
        let payload_size = entry.size - 11;
        let partition = self.partitions.get_mut(&name).expect("just ensured above");
        let bytes = partition
            .read_from(entry.position, Some(payload_size))?
            .ok_or_else(|| StoreError::CorruptFile {
                path: self.partition_path(&name),
                reason: format!("entry at position {} is missing", entry.position),
            })?;
        self.options.serializer.deserialize(&bytes)
    }

    pub fn primary_index(&self) -> &Index {
        &self.primary_index
    }

    pub fn secondary_index(&self, stream_name: &str) -> Result<&Index> {
        if let Some(stream) = self.secondary.get(stream_name) {
            return Ok(&stream.index);
        }
        Err(StoreError::InvalidArgument(format!("no such read stream {stream_name:?}")))
    }

    pub fn on_wrote(&mut self, callback: impl FnMut(&Value, &IndexEntry) + Send + 'static) {
        self.on_wrote.push(Box::new(callback));
    }

    pub fn on_index_add(&mut self, callback: impl FnMut(&str, u64, &Value) + Send + 'static) {
        self.on_index_add.push(Box::new(callback));
    }

    /// Re-opens any partitions/indexes the writer has created since this
    /// read-only instance was opened.
    pub fn refresh(&mut self) -> Result<()> {
        let Mode::ReadOnly { watcher } = &self.mode else {
            return Ok(());
        };
        if let Some(watcher) = watcher {
            let _ = watcher.drain();
        }
        self.primary_index.reload()?;
        for stream in self.secondary.values_mut() {
            stream.index.reload()?;
        }
        self.load_catalog()?;
        self.rebuild_partition_versions();
        // A `Partition` caches its size at open time; drop the cached
        // handles so the next read reopens them and observes the writer's
        // current file length (SPEC_FULL.md §4.9: "invalidating cached
        // lengths").
        self.partitions.clear();
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for partition in self.partitions.values_mut() {
            partition.close()?;
        }
        self.primary_index.close()?;
        for stream in self.secondary.values_mut() {
            stream.index.close()?;
        }
        if let Mode::Writable { lock, lock_path } = &mut self.mode {
            let _ = lock.unlock();
            let _ = fs::remove_file(lock_path);
        }
        self.closed = true;
        Ok(())
    }
}

impl DocumentReader for EventStore {
    fn read_document(&mut self, entry: &IndexEntry) -> Result<Value> {
        self.read_entry(entry)
    }
}

impl Drop for EventStore {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            tracing::error!(%error, "failed to close event store cleanly");
        }
    }
}

//! Lazy, bounded iteration over one or several indexes.
//!
//! Builder methods live on `EventStreamQuery`/`JoinEventStreamQuery`, which
//! are consumed by `build()`; the resulting `EventStream`/`JoinEventStream`
//! has no builder methods at all, so "mutating bounds after iteration has
//! begun" is a compile error rather than a runtime one.

use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::index::IndexEntry;
use crate::storage::{DocumentReader, EventStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

fn normalize_range(from: i64, to: i64, length: u64) -> Option<(u64, u64)> {
    let length = length as i64;
    let normalize = |v: i64| if v < 0 { length + v + 1 } else { v };
    let from = normalize(from);
    let to = normalize(to);
    if from < 1 || to > length || from > to {
        return None;
    }
    Some((from as u64, to as u64))
}

macro_rules! fluent_bounds {
    () => {
        pub fn from_start(mut self) -> Self {
            self.from = 1;
            self
        }
        pub fn from_end(mut self) -> Self {
            self.from = -1;
            self
        }
        pub fn to_start(mut self) -> Self {
            self.to = 1;
            self
        }
        pub fn to_end(mut self) -> Self {
            self.to = -1;
            self
        }
        pub fn from(mut self, n: i64) -> Self {
            self.from = n;
            self
        }
        pub fn until(mut self, n: i64) -> Self {
            self.to = n;
            self
        }
        pub fn first(mut self, n: u64) -> Self {
            self.from = 1;
            self.to = n as i64;
            self
        }
        pub fn last(mut self, n: u64) -> Self {
            self.from = -(n as i64);
            self.to = -1;
            self
        }
        pub fn forwards(mut self) -> Self {
            self.direction = Direction::Forward;
            self
        }
        pub fn backwards(mut self) -> Self {
            self.direction = Direction::Backward;
            self
        }
    };
}

pub struct EventStreamQuery<'a> {
    store: &'a mut EventStore,
    stream_name: String,
    from: i64,
    to: i64,
    direction: Direction,
}

impl<'a> EventStreamQuery<'a> {
    pub fn new(store: &'a mut EventStore, stream_name: &str) -> Self {
        Self { store, stream_name: stream_name.to_string(), from: 1, to: -1, direction: Direction::Forward }
    }

    fluent_bounds!();

    /// Materializes the (not-yet-read) bounds against the index's current
    /// length. Documents appended afterwards are not included.
    pub fn build(self) -> Result<EventStream<'a>> {
        let index = self.store.secondary_index(&self.stream_name)?;
        let length = index.len();
        let entries = match normalize_range(self.from, self.to, length) {
            Some((from, to)) => index.range(from as i64, Some(to as i64)).unwrap_or_default(),
            None => Vec::new(),
        };
        Ok(EventStream { store: self.store, entries, direction: self.direction, cursor: 0 })
    }
}

pub struct EventStream<'a> {
    store: &'a mut EventStore,
    entries: Vec<IndexEntry>,
    direction: Direction,
    cursor: usize,
}

impl<'a> EventStream<'a> {
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_at(&self, cursor: usize) -> Option<IndexEntry> {
        match self.direction {
            Direction::Forward => self.entries.get(cursor).copied(),
            Direction::Backward => {
                let idx = self.entries.len().checked_sub(cursor + 1)?;
                self.entries.get(idx).copied()
            }
        }
    }

    /// Materializes every remaining document into a `Vec`.
    pub fn events(&mut self) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        while let Some(doc) = self.next() {
            out.push(doc?);
        }
        Ok(out)
    }
}

impl<'a> Iterator for EventStream<'a> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entry_at(self.cursor)?;
        self.cursor += 1;
        Some(self.store.read_document(&entry).map(unwrap_payload))
    }
}

fn unwrap_payload(document: Value) -> Value {
    document.get("payload").cloned().unwrap_or(document)
}

pub struct JoinEventStreamQuery<'a> {
    store: &'a mut EventStore,
    streams: Vec<String>,
    from: i64,
    to: i64,
    direction: Direction,
}

impl<'a> JoinEventStreamQuery<'a> {
    pub fn new(store: &'a mut EventStore, streams: Vec<String>) -> Result<Self> {
        if streams.is_empty() {
            return Err(StoreError::InvalidArgument("join stream requires at least one stream".to_string()));
        }
        Ok(Self { store, streams, from: 1, to: -1, direction: Direction::Forward })
    }

    fluent_bounds!();

    /// Runs a k-way merge over each stream's secondary index, ordered by
    /// the shared global `number` (every secondary-index entry reuses the
    /// primary index's sequence number, so this is exactly global
    /// insertion order), then slices the merged sequence to the bounds.
    pub fn build(self) -> Result<JoinEventStream<'a>> {
        let mut per_stream: Vec<Vec<IndexEntry>> = Vec::with_capacity(self.streams.len());
        for name in &self.streams {
            let index = self.store.secondary_index(name)?;
            per_stream.push(index.all());
        }

        let merged = k_way_merge_by_number(per_stream);
        let length = merged.len() as u64;
        let entries = match normalize_range(self.from, self.to, length) {
            Some((from, to)) => merged[(from - 1) as usize..to as usize].to_vec(),
            None => Vec::new(),
        };

        Ok(JoinEventStream { store: self.store, entries, direction: self.direction, cursor: 0 })
    }
}

fn k_way_merge_by_number(mut streams: Vec<Vec<IndexEntry>>) -> Vec<IndexEntry> {
    let mut cursors = vec![0usize; streams.len()];
    let total: usize = streams.iter().map(Vec::len).sum();
    let mut merged = Vec::with_capacity(total);
    loop {
        let mut best: Option<(usize, IndexEntry)> = None;
        for (i, stream) in streams.iter().enumerate() {
            if let Some(&entry) = stream.get(cursors[i]) {
                if best.is_none_or(|(_, current)| entry.number < current.number) {
                    best = Some((i, entry));
                }
            }
        }
        match best {
            Some((i, entry)) => {
                merged.push(entry);
                cursors[i] += 1;
            }
            None => break,
        }
    }
    streams.clear();
    merged
}

pub struct JoinEventStream<'a> {
    store: &'a mut EventStore,
    entries: Vec<IndexEntry>,
    direction: Direction,
    cursor: usize,
}

impl<'a> JoinEventStream<'a> {
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    fn entry_at(&self, cursor: usize) -> Option<IndexEntry> {
        match self.direction {
            Direction::Forward => self.entries.get(cursor).copied(),
            Direction::Backward => {
                let idx = self.entries.len().checked_sub(cursor + 1)?;
                self.entries.get(idx).copied()
            }
        }
    }
}

impl<'a> Iterator for JoinEventStream<'a> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entry_at(self.cursor)?;
        self.cursor += 1;
        Some(self.store.read_document(&entry).map(unwrap_payload))
    }
}

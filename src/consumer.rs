//! Durable cursor over a read-stream.
//!
//! A [`Consumer`] persists `{position, state}` to a sidecar file. When a
//! handler sets new state, the new state and the new position are written
//! in the same atomic rename, so a crash mid-dispatch can never desync
//! them (exactly-once). If the handler leaves the state alone, the
//! position only advances in memory, which is why plain dispatch is only
//! at-least-once: a crash before the next state-setting turn redelivers
//! the events in between.
//!
//! Dispatch here is pull-based (`poll`), not push-based: the source model's
//! push dispatch relies on a suspension point between handler invocations
//! that a synchronous single-threaded library doesn't have. Callers drive
//! consumption by calling `poll` from their own loop after commits.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::index::Index;
use crate::DocumentReader;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedCursor {
    position: u64,
    state: Value,
}

pub struct Consumer {
    stream: String,
    id: String,
    state_path: PathBuf,
    position: u64,
    state: Value,
    active: bool,
}

/// Handed to the dispatch handler so it can opt into a new persisted state.
pub struct ConsumerCursor<'a> {
    new_state: &'a mut Option<Value>,
}

impl<'a> ConsumerCursor<'a> {
    pub fn set_state(&mut self, state: Value) {
        *self.new_state = Some(state);
    }
}

impl Consumer {
    pub fn open(
        data_dir: impl AsRef<Path>,
        storage_name: &str,
        stream: &str,
        consumer_id: &str,
        initial_state: Value,
    ) -> Result<Self> {
        let state_path = data_dir
            .as_ref()
            .join(format!("{storage_name}.{stream}.{consumer_id}.state"));

        let (position, state) = if state_path.exists() {
            let bytes = fs::read(&state_path)?;
            let cursor: PersistedCursor = serde_json::from_slice(&bytes).unwrap_or(PersistedCursor {
                position: 0,
                state: initial_state.clone(),
            });
            (cursor.position, cursor.state)
        } else {
            write_atomic(&state_path, &PersistedCursor { position: 0, state: initial_state.clone() })?;
            (0, initial_state)
        };

        Ok(Self {
            stream: stream.to_string(),
            id: consumer_id.to_string(),
            state_path,
            position,
            state,
            active: true,
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn start(&mut self) {
        self.active = true;
    }

    pub fn stop(&mut self) {
        self.active = false;
    }

    pub fn reset(&mut self, position: Option<u64>, state: Option<Value>) -> Result<()> {
        self.position = position.unwrap_or(0);
        self.state = state.unwrap_or(Value::Null);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        write_atomic(
            &self.state_path,
            &PersistedCursor { position: self.position, state: self.state.clone() },
        )
    }

    /// Dispatches every undelivered entry in `index` to `handler`. Returns
    /// `true` once the stream head has been reached ("caught-up").
    pub fn poll<R, F>(&mut self, index: &Index, reader: &mut R, mut handler: F) -> Result<bool>
    where
        R: DocumentReader,
        F: FnMut(&Value, &mut ConsumerCursor),
    {
        if !self.active {
            return Ok(true);
        }
        let head = index.len();
        while self.position < head {
            let entry = index
                .get(self.position + 1)
                .expect("entry within [1, len] must exist");
            let document = reader.read_document(&entry)?;

            let mut new_state = None;
            {
                let mut cursor = ConsumerCursor { new_state: &mut new_state };
                handler(&document, &mut cursor);
            }

            if let Some(state) = new_state {
                self.position += 1;
                self.state = state;
                self.persist()?;
            } else {
                self.position += 1;
            }
        }
        Ok(true)
    }
}

fn write_atomic(path: &Path, cursor: &PersistedCursor) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let bytes = serde_json::to_vec(cursor)
        .expect("cursor state is always serializable JSON");
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexEntry;
    use serde_json::json;
    use tempfile::tempdir;

    struct FakeReader(Vec<Value>);

    impl DocumentReader for FakeReader {
        fn read_document(&mut self, entry: &IndexEntry) -> Result<Value> {
            Ok(self.0[(entry.number - 1) as usize].clone())
        }
    }

    #[test]
    fn exactly_once_state_tracks_position() {
        let dir = tempdir().unwrap();
        let mut index = Index::open(dir.path().join("s.index"), None).unwrap();
        let docs: Vec<Value> = (1..=3)
            .map(|i| json!({"payload": {"d": 1}, "metadata": {}, "n": i}))
            .collect();
        for (i, _) in docs.iter().enumerate() {
            index
                .add(IndexEntry { number: i as u64 + 1, position: 0, size: 0, partition: 0 })
                .unwrap();
        }
        let mut reader = FakeReader(docs);

        let mut consumer =
            Consumer::open(dir.path(), "store", "orders", "c1", json!({"v": 0})).unwrap();

        let seen = std::cell::Cell::new(0u64);
        consumer
            .poll(&index, &mut reader, |_doc, cursor| {
                let next = seen.get() + 1;
                seen.set(next);
                cursor.set_state(json!({"v": next}));
            })
            .unwrap();

        assert_eq!(consumer.position(), 3);
        assert_eq!(consumer.state(), &json!({"v": 3}));
    }

    #[test]
    fn reopen_resumes_at_persisted_position() {
        let dir = tempdir().unwrap();
        {
            let mut c = Consumer::open(dir.path(), "store", "orders", "c1", json!(null)).unwrap();
            c.reset(Some(7), Some(json!({"v": 7}))).unwrap();
        }
        let c = Consumer::open(dir.path(), "store", "orders", "c1", json!(null)).unwrap();
        assert_eq!(c.position(), 7);
        assert_eq!(c.state(), &json!({"v": 7}));
    }
}

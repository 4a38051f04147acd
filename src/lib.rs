//! # stratum: an embedded, append-only event-storage engine
//!
//! Documents are appended to named [`partition`]s as length-prefixed frames;
//! an [`index`] records, for every appended document, where it landed and
//! how big it was. [`storage::EventStore`] composes a primary index (every
//! document, in commit order) with secondary indexes built by matching a
//! [`matcher::Matcher`] against each document's metadata, to form read
//! streams that can be consumed as an [`stream::EventStream`] or joined
//! across streams as a [`stream::JoinEventStream`]. A [`consumer::Consumer`]
//! layers a durable cursor on top of a read stream.
//!
//! ## Layout
//!
//! - [`partition`]: byte-level append-only segment files
//! - [`index`]: fixed-record positional index over a partition
//! - [`codec`]: pluggable document (de)serialization
//! - [`matcher`]: read-stream membership and its persisted form
//! - [`storage`]: the `EventStore` coordinator: commits, optimistic
//!   concurrency, stream creation
//! - [`stream`]: bounded, lazy iteration over one or several streams
//! - [`consumer`]: durable cursor over a read stream
//! - [`watch`]: directory watcher backing read-only instances
//! - [`error`]: the `StoreError` taxonomy shared by every module above
//!
//! ## Example
//!
//! ```ignore
//! use stratum::{EventStore, StorageOptions, ExpectedVersion, Matcher};
//! use serde_json::json;
//!
//! let mut store = EventStore::open("./data", "orders", StorageOptions::default())?;
//! store.commit("orders", vec![json!({"sku": "ABC"})], ExpectedVersion::Any, None)?;
//! store.create_stream("placed", Matcher::MetadataEquals(Default::default()))?;
//! # Ok::<(), stratum::StoreError>(())
//! ```

pub mod codec;
pub mod consumer;
pub mod error;
pub mod index;
pub mod matcher;
pub mod partition;
pub mod storage;
pub mod stream;
pub mod watch;

pub use codec::{JsonSerializer, Serializer};
pub use consumer::{Consumer, ConsumerCursor};
pub use error::{Result, StoreError};
pub use index::{Index, IndexEntry};
pub use matcher::{Matcher, StreamCatalogEntry};
pub use partition::{hash32, Partition};
pub use storage::{CommitResult, DocumentReader, EventStore, ExpectedVersion, StorageOptions};
pub use stream::{Direction, EventStream, EventStreamQuery, JoinEventStream, JoinEventStreamQuery};
pub use watch::DirectoryWatcher;

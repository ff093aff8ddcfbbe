//! Ember-KV: an embeddable key-value storage engine in the Bitcask mould.
//!
//! Ember-KV keeps every live key in an in-memory keydir pointing at its
//! value's location inside an append-only log, partitioned across sealed
//! data files plus one active file. Writes are coalesced into batches by
//! a dedicated flush worker; a background compactor rewrites sealed files
//! to reclaim the space of superseded and deleted records.
//!
//! # Features
//!
//! * O(1) lookups: one keydir probe plus one positioned read
//! * Batched, acknowledged writes with optional fsync per batch
//! * Size-triggered rotation of the active data file
//! * Concurrent compaction that never blocks readers or writers for I/O
//! * Crash recovery by replaying the data files, truncated tails ignored
//!
//! # Basic Usage
//!
//! ```
//! use bytes::Bytes;
//! use ember_kv::{db::Engine, option::Options};
//!
//! let mut opts = Options::default();
//! opts.dir_path = std::env::temp_dir().join("ember-kv-doc");
//! let engine = Engine::open(opts.clone()).expect("failed to open ember-kv engine");
//!
//! // Store a key-value pair; the completion resolves once it is durable.
//! let key = Bytes::from(b"hello".to_vec());
//! let value = Bytes::from(b"world".to_vec());
//! assert!(engine.put(key.clone(), value.clone()).wait().expect("failed to put"));
//!
//! // Retrieve the value.
//! let retrieved = engine.get(key.clone()).expect("failed to get");
//! assert_eq!(retrieved, Some(value));
//!
//! // Delete the key.
//! assert!(engine.remove(key).wait().expect("failed to remove"));
//!
//! drop(engine);
//! std::fs::remove_dir_all(&opts.dir_path).unwrap();
//! ```

mod compact;
mod data;
mod fio;
mod flush;
mod keydir;

pub mod db;
#[cfg(test)]
mod db_test;
pub mod errors;
pub mod option;
pub mod util;

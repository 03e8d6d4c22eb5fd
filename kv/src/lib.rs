#![allow(non_camel_case_types)]

//! `katamari` stores key/value pairs in a crash-safe append-only record
//! file, keeps an in-memory MVCC index of every version written, and layers
//! a search index and an ORM-style facade (TTL, caching, transactions) on
//! top. A WebSocket work dispatcher shards pipeline and lambda jobs across
//! a pool of workers, persisting shard assignments through the same
//! on-disk engine.
//!
//! ## Getting started
//!
//! ```rust
//! use std::path::PathBuf;
//! use katamari::error::Error;
//! use katamari::storage::engine::Engine;
//! use katamari::storage::record_engine::RecordEngine;
//!
//! fn main() {
//!     run().unwrap();
//! }
//!
//! fn run() -> Result<(), Error> {
//!     let storage_path = tempdir::TempDir::new("demo")?.path().join("katamari");
//!
//!     let mut engine = RecordEngine::new(storage_path)?;
//!     engine.set(b"b", vec![0x01])?;
//!     engine.set(b"b", vec![0x02])?;
//!
//!     engine.set(b"e", vec![0x05])?;
//!     engine.delete(b"e")?;
//!
//!     engine.set(b"a", vec![0x01])?;
//!
//!     assert_eq!(
//!         vec![(b"a".to_vec(), vec![0x01]), (b"b".to_vec(), vec![0x02])],
//!         engine.scan(..).collect::<Result<Vec<_>, Error>>()?,
//!     );
//!
//!     engine.flush()?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod mvcc;
pub mod orm;
pub mod search;
pub mod storage;

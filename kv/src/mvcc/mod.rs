pub mod mvcc;

/// An MVCC version is the 1-based position of a value within a key's
/// append-only history.
pub type Version = u64;

pub use mvcc::{Mvcc, VersionedValue};

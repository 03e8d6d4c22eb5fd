//! `katamari-cli` runs a dispatch server or worker process against a
//! `katamari` storage core.
//!
//! ```doc
//! ❯ ./katamari-cli serve --config config/katamari.yaml
//! ❯ ./katamari-cli worker --connect ws://127.0.0.1:7890 --id worker-1
//! ```

pub mod trace;

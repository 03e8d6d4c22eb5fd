//! Runtime configuration, loaded from YAML. The original Python surface
//! configures itself this way; the teacher's own `confy` defaults to TOML,
//! but YAML is kept here since several pack repos already reach for
//! `serde_yaml` for exactly this kind of nested operational config.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CResult;
use crate::search::SchemaFieldKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the on-disk engine's `.dat`/`.idx`/`.wal` triplet lives.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory tantivy persists its segments to; `None` keeps the index
    /// in memory only.
    #[serde(default)]
    pub search_index_dir: Option<PathBuf>,

    /// Field schema handed to `search::SearchIndex::new`.
    #[serde(default)]
    pub schema: HashMap<String, SchemaFieldKind>,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Upper bound on how many index updates are drained and committed
    /// together by the background indexing task.
    #[serde(default = "default_index_batch_size")]
    pub index_batch_size: usize,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/katamari")
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_index_batch_size() -> usize {
    256
}

fn default_bind_address() -> String {
    "0.0.0.0:7890".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            search_index_dir: None,
            schema: HashMap::new(),
            cache_capacity: default_cache_capacity(),
            index_batch_size: default_index_batch_size(),
            bind_address: default_bind_address(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> CResult<Config> {
        let bytes = std::fs::read(path)?;
        Ok(serde_yaml::from_slice(&bytes)?)
    }
}

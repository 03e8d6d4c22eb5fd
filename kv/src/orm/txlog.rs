//! An append-only newline-delimited-JSON transaction log protecting the
//! ORM's own multi-step write (lock -> log -> version -> index), not
//! distributed consistency. `start_tx` appends an entry; `commit_tx`
//! truncates the file; `rollback_tx` replays the logged keys as deletes
//! before truncating.

use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CResult;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxLogEntry {
    pub transaction_id: String,
    pub key: String,
    pub value: Value,
    pub ttl_seconds: Option<i64>,
}

pub struct TransactionLog {
    path: PathBuf,
}

impl TransactionLog {
    pub fn new(path: PathBuf) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(TransactionLog { path })
    }

    pub fn start_tx(&self, entry: &TxLogEntry) -> CResult<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    pub fn commit_tx(&self) -> CResult<()> {
        std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&self.path)?;
        Ok(())
    }

    /// Returns every entry still pending (i.e. not yet committed), in the
    /// order they were appended. Used both by `rollback_tx` and on
    /// process start to finish interrupted writes.
    pub fn pending(&self) -> CResult<Vec<TxLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Ok(serde_json::from_str(l)?))
            .collect()
    }

    pub fn rollback_tx(&self) -> CResult<Vec<TxLogEntry>> {
        let pending = self.pending()?;
        self.commit_tx()?;
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commit_truncates_the_log() {
        let dir = tempdir::TempDir::new("txlog").unwrap();
        let log = TransactionLog::new(dir.path().join("tx.log")).unwrap();

        log.start_tx(&TxLogEntry {
            transaction_id: "tx_1".to_string(),
            key: "k".to_string(),
            value: json!("v"),
            ttl_seconds: None,
        })
        .unwrap();
        assert_eq!(log.pending().unwrap().len(), 1);

        log.commit_tx().unwrap();
        assert!(log.pending().unwrap().is_empty());
    }

    #[test]
    fn rollback_returns_and_clears_pending_entries() {
        let dir = tempdir::TempDir::new("txlog").unwrap();
        let log = TransactionLog::new(dir.path().join("tx.log")).unwrap();

        log.start_tx(&TxLogEntry {
            transaction_id: "tx_1".to_string(),
            key: "k".to_string(),
            value: json!("v"),
            ttl_seconds: None,
        })
        .unwrap();

        let rolled_back = log.rollback_tx().unwrap();
        assert_eq!(rolled_back.len(), 1);
        assert!(log.pending().unwrap().is_empty());
    }
}

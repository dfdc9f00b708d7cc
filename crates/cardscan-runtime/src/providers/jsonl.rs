//! Append-only JSON-lines scan store.

use async_trait::async_trait;
use cardscan_core::ScanRecord;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::ScanStore;
use crate::error::DependencyError;

/// Writes one JSON object per scan to a file.
#[derive(Debug)]
pub struct JsonlScanStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlScanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ScanStore for JsonlScanStore {
    async fn persist(&self, record: &ScanRecord) -> Result<(), DependencyError> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| DependencyError::Internal(e.to_string()))?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| DependencyError::unavailable(format!("{}: {}", self.path.display(), e)))?;
        file.write_all(&line)
            .await
            .map_err(|e| DependencyError::unavailable(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| DependencyError::unavailable(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardscan_core::{Prediction, ScanMode};

    #[tokio::test]
    async fn test_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlScanStore::new(dir.path().join("scans.jsonl"));

        let record = ScanRecord::from_prediction(Prediction::unknown("error_fallback"), ScanMode::Error);
        store.persist(&record).await.unwrap();
        store.persist(&record).await.unwrap();

        let contents = tokio::fs::read_to_string(store.path()).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: ScanRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.model_version, "error_fallback");
    }

    #[tokio::test]
    async fn test_missing_directory_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlScanStore::new(dir.path().join("missing").join("scans.jsonl"));

        let record = ScanRecord::from_prediction(Prediction::unknown("x"), ScanMode::Error);
        let err = store.persist(&record).await.unwrap_err();
        assert!(err.is_transient());
    }
}

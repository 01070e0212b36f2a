use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::mqtt::{MessageRecord, MessageRecorder, StoreError};

/// Message history as one JSON object per line.
///
/// Appends are serialized by an internal lock so concurrent writers never
/// interleave partial lines. The file and its parent directories are created
/// on the first append.
#[derive(Debug)]
pub struct JsonlMessageLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlMessageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Latest `limit` records, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<MessageRecord>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read_all().await?;
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    /// Deletes the whole history and returns how many records it held.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let count = self.read_all().await?.len();
        if tokio::fs::try_exists(&self.path).await? {
            tokio::fs::remove_file(&self.path).await?;
        }
        info!("Cleared {} message record(s) from {}", count, self.path.display());
        Ok(count)
    }

    async fn read_all(&self) -> Result<Vec<MessageRecord>, StoreError> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        let records = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(idx, line)| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(
                        "Skipping malformed record at {}:{}: {}",
                        self.path.display(),
                        idx + 1,
                        e
                    );
                    None
                }
            })
            .collect();
        Ok(records)
    }
}

#[async_trait]
impl MessageRecorder for JsonlMessageLog {
    async fn append(&self, record: MessageRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!("Recorded {} message on {}", record.direction, record.topic);
        Ok(())
    }
}

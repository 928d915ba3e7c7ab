use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_common::error::{Result, TallyError};
use tokio::{fs::OpenOptions, io::AsyncWriteExt};

use crate::log::EntryId;

/// An entry that will never be processed, kept with the reason it was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub entry: EntryId,
    pub payload: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Must be durable on `Ok`; the entry is acknowledged right after.
    async fn send(&self, letter: &DeadLetter) -> Result<()>;
}

#[derive(Debug)]
pub struct FileDeadLetterSink {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileDeadLetterSink {
    pub const FILE_NAME: &'static str = "dead-letter.log";

    /// Letters are appended as JSON lines to `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        })
    }

    pub async fn in_dir(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open(dir.as_ref().join(Self::FILE_NAME)).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read_all(&self) -> Result<Vec<DeadLetter>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        text.lines()
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|err| {
                    TallyError::InternalError(format!("corrupt dead letter record: {err}"))
                })
            })
            .collect()
    }
}

#[async_trait]
impl DeadLetterSink for FileDeadLetterSink {
    async fn send(&self, letter: &DeadLetter) -> Result<()> {
        let mut line = serde_json::to_string(letter).map_err(|err| {
            TallyError::InternalError(format!("failed to encode dead letter: {err}"))
        })?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn send(&self, letter: &DeadLetter) -> Result<()> {
        self.letters
            .lock()
            .map_err(|_| TallyError::InternalError("dead letter lock poisoned".to_string()))?
            .push(letter.clone());
        Ok(())
    }
}

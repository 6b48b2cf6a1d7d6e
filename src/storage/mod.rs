// src/storage/mod.rs - Flat key-value persistence for counters and ledgers

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Minimal persistence surface the bot core needs: string values keyed by
/// name, plus line-append for the first-time-chatter ledger.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a value. `None` means the key has never been written.
    async fn read(&self, key: &str) -> Result<Option<String>>;

    async fn write(&self, key: &str, value: &str) -> Result<()>;

    /// Append one line to the value, creating the key if needed.
    async fn append(&self, key: &str, line: &str) -> Result<()>;
}

/// One file per key under a data directory, matching the bot's on-disk layout
/// of `counter_<name>.txt` and `all_chatters.txt`.
pub struct FileStorage {
    base_dir: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.txt"))
    }

    async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .await
            .with_context(|| format!("failed to create data dir {}", self.base_dir.display()))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_dir().await?;
        let path = self.path_for(key);
        fs::write(&path, value)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    async fn append(&self, key: &str, line: &str) -> Result<()> {
        self.ensure_dir().await?;
        let path = self.path_for(key);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {} for append", path.display()))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .with_context(|| format!("failed to append to {}", path.display()))
    }
}

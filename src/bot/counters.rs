// src/bot/counters.rs - Named persistent counters (deaths, wins, ...)

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::storage::Storage;

/// Durable named counters. Each counter lives in its own storage key so a
/// stray edit to one file cannot corrupt the rest. All mutations run under
/// one lock, so concurrent bumps of the same counter never lose updates.
pub struct CounterStore {
    storage: Arc<dyn Storage>,
    lock: Mutex<()>,
}

/// Counter names come straight from chat, so squeeze them down to a safe
/// filename alphabet before they ever touch the filesystem.
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

impl CounterStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    fn key(name: &str) -> String {
        format!("counter_{name}")
    }

    async fn read_value(&self, name: &str) -> Result<i64> {
        let value = self
            .storage
            .read(&Self::key(name))
            .await?
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        Ok(value)
    }

    pub async fn get(&self, name: &str) -> Result<i64> {
        let _guard = self.lock.lock().await;
        self.read_value(name).await
    }

    pub async fn increment(&self, name: &str, delta: i64) -> Result<i64> {
        let _guard = self.lock.lock().await;
        let value = self.read_value(name).await?.saturating_add(delta);
        self.storage.write(&Self::key(name), &value.to_string()).await?;
        Ok(value)
    }

    /// Decrement, clamped so the counter never drops below `floor`.
    pub async fn decrement(&self, name: &str, delta: i64, floor: i64) -> Result<i64> {
        let _guard = self.lock.lock().await;
        let value = self.read_value(name).await?.saturating_sub(delta).max(floor);
        self.storage.write(&Self::key(name), &value.to_string()).await?;
        Ok(value)
    }

    /// Set to an exact value. Negative values are allowed here; only
    /// decrements are clamped.
    pub async fn set(&self, name: &str, value: i64) -> Result<i64> {
        let _guard = self.lock.lock().await;
        self.storage.write(&Self::key(name), &value.to_string()).await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorage;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> CounterStore {
        CounterStore::new(Arc::new(FileStorage::new(dir.path())))
    }

    #[test]
    fn sanitize_strips_hostile_characters() {
        assert_eq!(sanitize_name("deaths"), "deaths");
        assert_eq!(sanitize_name("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_name("boss-2_kills!"), "boss-2_kills");
    }

    #[tokio::test]
    async fn missing_counter_reads_as_zero() {
        let dir = tempdir().unwrap();
        assert_eq!(store(&dir).get("deaths").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn increments_accumulate_across_instances() {
        let dir = tempdir().unwrap();
        assert_eq!(store(&dir).increment("deaths", 1).await.unwrap(), 1);
        assert_eq!(store(&dir).increment("deaths", 2).await.unwrap(), 3);
        assert_eq!(store(&dir).get("deaths").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn decrement_clamps_at_floor() {
        let dir = tempdir().unwrap();
        let counters = store(&dir);
        counters.set("deaths", 1).await.unwrap();
        assert_eq!(counters.decrement("deaths", 5, 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn set_accepts_negative_values() {
        let dir = tempdir().unwrap();
        let counters = store(&dir);
        assert_eq!(counters.set("handicap", -4).await.unwrap(), -4);
        assert_eq!(counters.get("handicap").await.unwrap(), -4);
    }

    #[tokio::test]
    async fn garbage_file_contents_read_as_zero() {
        let dir = tempdir().unwrap();
        let counters = store(&dir);
        counters.set("deaths", 7).await.unwrap();
        std::fs::write(dir.path().join("counter_deaths.txt"), "not a number").unwrap();
        assert_eq!(counters.get("deaths").await.unwrap(), 0);
    }
}

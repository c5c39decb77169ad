//! Release persistence.
//!
//! Releases are written once and never changed. Whether a release
//! succeeded is tracked next to it so that later blue/green rollouts can
//! find the color currently serving traffic.

use super::model::Release;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Identifier for the next release
    async fn next_id(&self) -> Result<u64>;

    async fn create(&self, release: &Release) -> Result<()>;

    async fn mark_succeeded(&self, release_id: u64) -> Result<()>;

    /// Latest succeeded release of `project` created before `before_id`
    async fn previous_succeeded(&self, project: &str, before_id: u64) -> Result<Option<Release>>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoredReleases {
    releases: Vec<Release>,
    succeeded: BTreeSet<u64>,
}

impl StoredReleases {
    fn next_id(&self) -> u64 {
        self.releases.iter().map(|r| r.id).max().unwrap_or(0) + 1
    }

    fn create(&mut self, release: &Release) -> Result<()> {
        if self.releases.iter().any(|r| r.id == release.id) {
            return Err(Error::Store(format!("release {} already exists", release.id)));
        }
        self.releases.push(release.clone());
        Ok(())
    }

    fn mark_succeeded(&mut self, release_id: u64) -> Result<()> {
        if !self.releases.iter().any(|r| r.id == release_id) {
            return Err(Error::Store(format!("unknown release {release_id}")));
        }
        self.succeeded.insert(release_id);
        Ok(())
    }

    fn previous_succeeded(&self, project: &str, before_id: u64) -> Option<Release> {
        self.releases
            .iter()
            .filter(|r| r.project == project && r.id < before_id)
            .filter(|r| self.succeeded.contains(&r.id))
            .max_by_key(|r| r.id)
            .cloned()
    }
}

#[derive(Default)]
pub struct InMemoryReleaseStore {
    inner: Mutex<StoredReleases>,
}

impl InMemoryReleaseStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReleaseStore for InMemoryReleaseStore {
    async fn next_id(&self) -> Result<u64> {
        Ok(self.inner.lock().await.next_id())
    }

    async fn create(&self, release: &Release) -> Result<()> {
        self.inner.lock().await.create(release)
    }

    async fn mark_succeeded(&self, release_id: u64) -> Result<()> {
        self.inner.lock().await.mark_succeeded(release_id)
    }

    async fn previous_succeeded(&self, project: &str, before_id: u64) -> Result<Option<Release>> {
        Ok(self.inner.lock().await.previous_succeeded(project, before_id))
    }
}

/// Keeps releases in a single JSON file so state survives between runs
pub struct JsonFileReleaseStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileReleaseStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<StoredReleases> {
        match fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(StoredReleases::default()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoredReleases::default()),
            Err(e) => Err(Error::Store(format!(
                "failed to read {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn save(&self, stored: &StoredReleases) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(stored)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), releases = stored.releases.len(), "Saved release store");
        Ok(())
    }
}

#[async_trait]
impl ReleaseStore for JsonFileReleaseStore {
    async fn next_id(&self) -> Result<u64> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.next_id())
    }

    async fn create(&self, release: &Release) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut stored = self.load().await?;
        stored.create(release)?;
        self.save(&stored).await
    }

    async fn mark_succeeded(&self, release_id: u64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut stored = self.load().await?;
        stored.mark_succeeded(release_id)?;
        self.save(&stored).await
    }

    async fn previous_succeeded(&self, project: &str, before_id: u64) -> Result<Option<Release>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.previous_succeeded(project, before_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::model::Color;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn release(id: u64, project: &str, color: Option<Color>) -> Release {
        Release {
            id,
            project: project.to_string(),
            git_ref: "main".to_string(),
            git_sha: "abc123".to_string(),
            job_id: None,
            blue_green_color: color,
            created_at: Utc::now(),
            docs: vec![],
            role_templates: BTreeMap::new(),
        }
    }

    async fn exercise(store: &dyn ReleaseStore) {
        assert_eq!(store.next_id().await.unwrap(), 1);
        store.create(&release(1, "app", Some(Color::Blue))).await.unwrap();
        store.create(&release(2, "app", Some(Color::Green))).await.unwrap();
        store.create(&release(3, "other", None)).await.unwrap();
        assert_eq!(store.next_id().await.unwrap(), 4);

        assert!(store.previous_succeeded("app", 10).await.unwrap().is_none());

        store.mark_succeeded(1).await.unwrap();
        store.mark_succeeded(3).await.unwrap();
        let previous = store.previous_succeeded("app", 10).await.unwrap().unwrap();
        assert_eq!(previous.id, 1);
        assert_eq!(previous.blue_green_color, Some(Color::Blue));

        store.mark_succeeded(2).await.unwrap();
        assert_eq!(store.previous_succeeded("app", 10).await.unwrap().unwrap().id, 2);
        assert_eq!(store.previous_succeeded("app", 2).await.unwrap().unwrap().id, 1);

        assert!(store.create(&release(2, "app", None)).await.is_err());
        assert!(store.mark_succeeded(99).await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        exercise(&InMemoryReleaseStore::new()).await;
    }

    #[tokio::test]
    async fn test_json_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("releases.json");
        exercise(&JsonFileReleaseStore::new(&path)).await;

        let reopened = JsonFileReleaseStore::new(&path);
        assert_eq!(reopened.next_id().await.unwrap(), 4);
        assert_eq!(
            reopened.previous_succeeded("app", 10).await.unwrap().unwrap().id,
            2
        );
    }
}

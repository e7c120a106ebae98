//! JSON document stores on disk, one file per entity kind

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::store::{LocalStore, Stored};

/// Rows of an entity store keyed by id.
pub type EntityDocument<V> = HashMap<String, Stored<V>>;

/// A whole serde document kept in memory and written back on every change.
///
/// Without a path the document only lives in memory.
#[derive(Debug)]
pub struct DocumentStore<D> {
    path: Option<PathBuf>,
    doc: Mutex<D>,
}

impl<D> DocumentStore<D>
where
    D: Serialize + DeserializeOwned + Default,
{
    pub fn in_memory() -> Self {
        Self {
            path: None,
            doc: Mutex::new(D::default()),
        }
    }

    /// Load the document at `path`. A missing file starts empty; an unreadable
    /// one is logged and replaced on the next write.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let doc = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Discarding corrupt cache file");
                    D::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No cache file yet");
                D::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };

        Ok(Self {
            path: Some(path),
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn read<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        f(&self.doc.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Apply `f` and write the document back to disk.
    pub async fn write<R>(&self, f: impl FnOnce(&mut D) -> R) -> Result<R> {
        let (result, content) = {
            let mut doc = self.doc.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let result = f(&mut doc);
            let content = match self.path {
                Some(_) => Some(serde_json::to_string(&*doc)?),
                None => None,
            };
            (result, content)
        };

        if let (Some(path), Some(content)) = (&self.path, content) {
            save_atomically(path, &content).await?;
        }
        Ok(result)
    }
}

async fn save_atomically(path: &Path, content: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
    }

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Entity store persisted as one JSON file.
pub type JsonFileStore<V> = DocumentStore<EntityDocument<V>>;

#[async_trait]
impl<V> LocalStore<V> for DocumentStore<EntityDocument<V>>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn fetch_one(&self, id: &str) -> Result<Option<Stored<V>>> {
        Ok(self.read(|rows| rows.get(id).cloned()))
    }

    async fn fetch_many(&self, ids: &[String]) -> Result<Vec<Option<Stored<V>>>> {
        Ok(self.read(|rows| ids.iter().map(|id| rows.get(id).cloned()).collect()))
    }

    async fn persist(&self, id: &str, value: V, fetched_at: DateTime<Utc>) -> Result<Stored<V>> {
        let stored = Stored::new(value, fetched_at);
        let row = stored.clone();
        self.write(move |rows| rows.insert(id.to_string(), row)).await?;
        Ok(stored)
    }

    /// One write for the whole batch.
    async fn persist_many(&self, rows: Vec<(String, V)>, fetched_at: DateTime<Utc>) -> Result<()> {
        self.write(move |doc| {
            for (id, value) in rows {
                doc.insert(id, Stored::new(value, fetched_at));
            }
        })
        .await
    }
}

//! Remote source of truth for one entity kind

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait RemoteSource<V: Send + 'static>: Send + Sync {
    /// `Ok(None)` means the service confirmed there is no such entity.
    async fn fetch_one(&self, id: &str) -> Result<Option<V>>;

    /// Positional: slot `i` answers `ids[i]`. Without a batch endpoint this
    /// fans out to [`fetch_one`](Self::fetch_one) concurrently.
    async fn fetch_many(&self, ids: &[String]) -> Result<Vec<Option<V>>> {
        futures::future::try_join_all(ids.iter().map(|id| self.fetch_one(id))).await
    }
}

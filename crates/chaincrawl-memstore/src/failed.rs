use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use chaincrawl_core::{CrawlResult, FailedUpdate, FailedUpdateStore};

/// `<channel namespace>/<id>`, e.g. `store:failed/1f0c...`
pub fn failed_key(failed: &FailedUpdate) -> String {
    format!("{}/{}", failed.update.channel().failed_namespace(), failed.id)
}

#[derive(Default)]
struct Sets {
    parked: BTreeMap<String, FailedUpdate>,
    dead: BTreeMap<String, FailedUpdate>,
}

/// Dead-letter store that forgets everything on restart
#[derive(Default)]
pub struct MemFailedStore {
    sets: RwLock<Sets>,
}

impl MemFailedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FailedUpdateStore for MemFailedStore {
    async fn park(&self, failed: FailedUpdate) -> CrawlResult<()> {
        self.sets.write().await.parked.insert(failed_key(&failed), failed);
        Ok(())
    }

    async fn list_failed(&self) -> CrawlResult<Vec<FailedUpdate>> {
        Ok(self.sets.read().await.parked.values().cloned().collect())
    }

    async fn remove(&self, id: &str) -> CrawlResult<()> {
        self.sets.write().await.parked.retain(|_, f| f.id != id);
        Ok(())
    }

    async fn bury(&self, failed: FailedUpdate) -> CrawlResult<()> {
        let key = failed_key(&failed);
        let mut sets = self.sets.write().await;
        sets.parked.remove(&key);
        sets.dead.insert(key, failed);
        Ok(())
    }

    async fn list_dead(&self) -> CrawlResult<Vec<FailedUpdate>> {
        Ok(self.sets.read().await.dead.values().cloned().collect())
    }
}

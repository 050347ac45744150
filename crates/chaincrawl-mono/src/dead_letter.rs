//! RocksDB-backed dead-letter store for updates that exhausted their retries

use async_trait::async_trait;
use log::info;
use rocksdb::{Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;

use chaincrawl_core::{CrawlError, CrawlResult, FailedUpdate, FailedUpdateStore, UpdateChannel};
use chaincrawl_memstore::failed_key;

const DEAD_PREFIX: &str = "dead/";

fn storage_error(e: rocksdb::Error) -> CrawlError {
    CrawlError::Storage(e.to_string())
}

/// Parked updates live under `library:failed/<id>` and `store:failed/<id>`.
/// Buried updates keep the same key behind a `dead/` prefix.
#[derive(Clone)]
pub struct RocksDbFailedStore {
    db: Arc<DB>,
}

impl RocksDbFailedStore {
    pub fn open(path: impl AsRef<Path>) -> CrawlResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.increase_parallelism(num_cpus::get() as i32);
        let db = DB::open(&opts, path.as_ref()).map_err(storage_error)?;
        info!("Dead-letter store opened at {}", path.as_ref().display());
        Ok(Self { db: Arc::new(db) })
    }

    fn scan_prefix(&self, prefix: &str) -> CrawlResult<Vec<FailedUpdate>> {
        let mut results = Vec::new();
        let mut iter = self.db.raw_iterator();
        iter.seek(prefix.as_bytes());
        while iter.valid() {
            match (iter.key(), iter.value()) {
                (Some(key), Some(value)) if key.starts_with(prefix.as_bytes()) => {
                    results.push(serde_json::from_slice(value)?);
                }
                _ => break,
            }
            iter.next();
        }
        iter.status().map_err(storage_error)?;
        Ok(results)
    }

    fn put(&self, key: &str, failed: &FailedUpdate) -> CrawlResult<()> {
        let value = serde_json::to_vec(failed)?;
        self.db.put(key.as_bytes(), value).map_err(storage_error)
    }
}

#[async_trait]
impl FailedUpdateStore for RocksDbFailedStore {
    async fn park(&self, failed: FailedUpdate) -> CrawlResult<()> {
        self.put(&failed_key(&failed), &failed)
    }

    async fn list_failed(&self) -> CrawlResult<Vec<FailedUpdate>> {
        let mut all = Vec::new();
        for channel in [UpdateChannel::Library, UpdateChannel::Store] {
            all.extend(self.scan_prefix(&format!("{}/", channel.failed_namespace()))?);
        }
        Ok(all)
    }

    async fn remove(&self, id: &str) -> CrawlResult<()> {
        let mut batch = WriteBatch::default();
        for channel in [UpdateChannel::Library, UpdateChannel::Store] {
            batch.delete(format!("{}/{}", channel.failed_namespace(), id).as_bytes());
        }
        self.db.write(batch).map_err(storage_error)
    }

    async fn bury(&self, failed: FailedUpdate) -> CrawlResult<()> {
        let key = failed_key(&failed);
        let mut batch = WriteBatch::default();
        batch.delete(key.as_bytes());
        batch.put(
            format!("{}{}", DEAD_PREFIX, key).as_bytes(),
            serde_json::to_vec(&failed)?,
        );
        self.db.write(batch).map_err(storage_error)
    }

    async fn list_dead(&self) -> CrawlResult<Vec<FailedUpdate>> {
        self.scan_prefix(DEAD_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaincrawl_core::{ParkedUpdate, StoreActivity, StoreUpdate};
    use tempfile::TempDir;

    fn failed(id: &str) -> FailedUpdate {
        FailedUpdate {
            id: id.to_string(),
            update: ParkedUpdate::Store(StoreUpdate {
                chain_id: "bsc".into(),
                contract_address: "0xc0".into(),
                token_id: "5".into(),
                from: "0xa1".into(),
                to: "0xb2".into(),
                transaction_hash: "0xt".into(),
                log_index: 0,
                block_number: 77,
                timestamp: 1,
                activity: StoreActivity::Transfer,
            }),
            error: "storage error: timeout".into(),
            failed_at: 10,
            recovery_attempts: 0,
        }
    }

    #[tokio::test]
    async fn test_parked_updates_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksDbFailedStore::open(dir.path()).unwrap();
            store.park(failed("one")).await.unwrap();
            store.park(failed("two")).await.unwrap();
        }
        let store = RocksDbFailedStore::open(dir.path()).unwrap();
        let parked = store.list_failed().await.unwrap();
        let ids: Vec<_> = parked.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_remove_and_bury() {
        let dir = TempDir::new().unwrap();
        let store = RocksDbFailedStore::open(dir.path()).unwrap();
        store.park(failed("one")).await.unwrap();
        store.park(failed("two")).await.unwrap();

        store.remove("one").await.unwrap();
        let mut two = failed("two");
        two.recovery_attempts = 10;
        store.bury(two.clone()).await.unwrap();

        assert!(store.list_failed().await.unwrap().is_empty());
        assert_eq!(store.list_dead().await.unwrap(), vec![two]);
    }
}

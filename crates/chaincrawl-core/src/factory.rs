//! Lazily constructed, cached chain adapters

use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::{AdapterBuilder, ChainAdapter, ChainConfig, CrawlError, CrawlResult};

/// Single point of adapter lifecycle.
///
/// Each configured chain gets at most one adapter, built on first use and
/// cached until cleared. An adapter that cannot reach its endpoint at creation
/// time is not cached, so the next call tries again.
pub struct ChainAdapterFactory {
    configs: BTreeMap<String, ChainConfig>,
    builder: Arc<dyn AdapterBuilder>,
    adapters: RwLock<HashMap<String, Arc<dyn ChainAdapter>>>,
    creating: Mutex<()>,
}

impl ChainAdapterFactory {
    pub fn new(configs: Vec<ChainConfig>, builder: Arc<dyn AdapterBuilder>) -> Self {
        Self {
            configs: configs
                .into_iter()
                .map(|c| (c.chain_id.clone(), c))
                .collect(),
            builder,
            adapters: RwLock::new(HashMap::new()),
            creating: Mutex::new(()),
        }
    }

    pub fn chain_ids(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    pub fn chain_config(&self, chain_id: &str) -> Option<&ChainConfig> {
        self.configs.get(chain_id)
    }

    pub fn chain_configs(&self) -> impl Iterator<Item = &ChainConfig> {
        self.configs.values()
    }

    pub async fn get_adapter(&self, chain_id: &str) -> CrawlResult<Arc<dyn ChainAdapter>> {
        if let Some(adapter) = self.adapters.read().await.get(chain_id) {
            return Ok(adapter.clone());
        }

        let config = self
            .configs
            .get(chain_id)
            .ok_or_else(|| CrawlError::UnsupportedChain(chain_id.to_string()))?;

        let _guard = self.creating.lock().await;
        if let Some(adapter) = self.adapters.read().await.get(chain_id) {
            return Ok(adapter.clone());
        }

        let adapter = self.builder.build(config).await?;
        if !adapter.is_connected().await {
            return Err(CrawlError::rpc(
                chain_id,
                format!("endpoint {} is not reachable", config.rpc_url),
            ));
        }
        info!("[{}] adapter initialized against {}", chain_id, config.rpc_url);
        self.adapters
            .write()
            .await
            .insert(chain_id.to_string(), adapter.clone());
        Ok(adapter)
    }

    /// Create every configured adapter; returns how many are ready.
    pub async fn initialize_all_adapters(&self) -> usize {
        let mut ready = 0;
        for chain_id in self.configs.keys() {
            match self.get_adapter(chain_id).await {
                Ok(_) => ready += 1,
                Err(e) => warn!("[{}] adapter initialization failed: {}", chain_id, e),
            }
        }
        ready
    }

    pub async fn get_all_adapters(&self) -> Vec<Arc<dyn ChainAdapter>> {
        self.adapters.read().await.values().cloned().collect()
    }

    pub async fn clear_adapter(&self, chain_id: &str) -> bool {
        self.adapters.write().await.remove(chain_id).is_some()
    }

    pub async fn clear_all_adapters(&self) {
        self.adapters.write().await.clear();
    }
}

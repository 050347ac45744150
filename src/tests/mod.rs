//! Scenario harness for the crawler pipeline
//!
//! A [`Scenario`] starts the same [`Pipeline`] the service binary runs, with
//! mock chains and in-memory collaborators, and fast loop intervals so tests
//! finish in well under a second of crawling.

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chaincrawl_core::decode::encode::transfer_log;
use chaincrawl_core::{
    ChainAdapter, ChainConfig, CrawlerConfig, MockAdapterBuilder, MockChainAdapter,
    ProcessorConfig, RawLog, WalletRegistry,
};
use chaincrawl_memstore::{MemFailedStore, MemPubSub, MemStorage, MemWalletRegistry};
use chaincrawl_mono::{AppState, Collaborators, Pipeline, PipelineConfig};

pub mod reorg_test;

pub const CONTRACT: &str = "0x5555555555555555555555555555555555555555";
pub const MARKET: &str = "0x6666666666666666666666666666666666666666";
pub const ALICE: &str = "0x1111111111111111111111111111111111111111";
pub const BOB: &str = "0x2222222222222222222222222222222222222222";
pub const CAROL: &str = "0x3333333333333333333333333333333333333333";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Mock chain that starts crawling at block 1 with no confirmation depth
pub fn mock_chain(chain_id: &str) -> MockChainAdapter {
    MockChainAdapter::new(
        ChainConfig::new(chain_id, format!("mock://{}", chain_id)).with_start_block(1),
    )
}

pub fn transfer(from: &str, to: &str, token_id: u64, tx: &str, block: u64) -> Result<RawLog> {
    Ok(transfer_log(CONTRACT, from, to, token_id, tx, 0, block)?)
}

/// Poll `check` until it holds, failing after ten seconds
pub async fn wait_until<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for {}", what))
}

pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        crawler: CrawlerConfig {
            coordination_interval: Duration::from_millis(10),
            backoff_delay: Duration::from_millis(5),
            health_check_interval: Duration::from_millis(200),
            ..CrawlerConfig::with_concurrency(4)
        },
        processor: ProcessorConfig {
            retry_limit: 2,
            retry_delay: Duration::from_millis(1),
            ..ProcessorConfig::default()
        },
        recovery_interval: Duration::from_secs(3600),
    }
}

pub struct ScenarioBuilder {
    chains: Vec<MockChainAdapter>,
    config: PipelineConfig,
    storage: Arc<MemStorage>,
    registry: Arc<MemWalletRegistry>,
    wallets: Vec<(String, String)>,
}

impl ScenarioBuilder {
    pub fn chain(mut self, chain: MockChainAdapter) -> Self {
        self.chains.push(chain);
        self
    }

    /// Register `address` for `user_id` before crawling starts
    pub fn wallet(mut self, address: &str, user_id: &str) -> Self {
        self.wallets.push((address.to_string(), user_id.to_string()));
        self
    }

    /// The store the scenario will run against, available before it starts
    pub fn storage(&self) -> Arc<MemStorage> {
        self.storage.clone()
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn start(self) -> Result<Scenario> {
        init_logging();
        for (address, user_id) in &self.wallets {
            self.registry.register_wallet(address, user_id).await?;
        }
        let failed = Arc::new(MemFailedStore::new());
        let pubsub = Arc::new(MemPubSub::default());
        let collaborators = Collaborators {
            storage: self.storage.clone(),
            registry: self.registry.clone(),
            failed: failed.clone(),
            pubsub: pubsub.clone(),
        };
        let builder = self
            .chains
            .iter()
            .cloned()
            .fold(MockAdapterBuilder::new(), MockAdapterBuilder::with_adapter);
        let configs = self.chains.iter().map(|c| c.config().clone()).collect();
        let pipeline = Pipeline::start(self.config, configs, Arc::new(builder), &collaborators).await?;
        let state = AppState::new(&pipeline, &collaborators);
        Ok(Scenario {
            pipeline,
            state,
            storage: self.storage,
            registry: self.registry,
            failed,
            pubsub,
        })
    }
}

pub struct Scenario {
    pub pipeline: Pipeline,
    pub state: AppState,
    pub storage: Arc<MemStorage>,
    pub registry: Arc<MemWalletRegistry>,
    pub failed: Arc<MemFailedStore>,
    pub pubsub: Arc<MemPubSub>,
}

impl Scenario {
    pub fn builder() -> ScenarioBuilder {
        ScenarioBuilder {
            chains: Vec::new(),
            config: fast_config(),
            storage: Arc::new(MemStorage::new()),
            registry: Arc::new(MemWalletRegistry::new()),
            wallets: Vec::new(),
        }
    }

    /// Wait until the chain's contiguous watermark reaches `block`
    pub async fn wait_for_block(&self, chain_id: &str, block: u64) -> Result<()> {
        let coordinator = self.pipeline.coordinator.clone();
        tokio::time::timeout(Duration::from_secs(10), async move {
            loop {
                let status = coordinator.status();
                if status
                    .chain(chain_id)
                    .map_or(false, |c| c.processed_block >= block)
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("{} did not reach block {}", chain_id, block))
    }

    pub async fn shutdown(self) {
        self.pipeline.shutdown().await;
    }
}

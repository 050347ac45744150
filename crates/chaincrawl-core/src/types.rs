//! Common types for chaincrawl-core

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{CrawlError, CrawlResult};

/// Address every mint originates from and every burn is sent to.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Immutable per-chain settings supplied at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: String,
    pub rpc_url: String,
    pub start_block: u64,
    pub confirmations: u64,
}

impl ChainConfig {
    pub fn new(chain_id: impl Into<String>, rpc_url: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            rpc_url: rpc_url.into(),
            start_block: 0,
            confirmations: 0,
        }
    }

    pub fn with_start_block(mut self, start_block: u64) -> Self {
        self.start_block = start_block;
        self
    }

    pub fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = confirmations;
        self
    }
}

/// Block header plus the hashes of the transactions it contains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
    pub transactions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub block_number: Option<u64>,
    pub from: String,
    pub to: Option<String>,
    /// Transferred value in wei, decimal
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: u64,
    pub transaction_hash: String,
    pub log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub block_number: u64,
    pub status: bool,
    pub logs: Vec<RawLog>,
}

/// Decoded token transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEvent {
    pub chain_id: String,
    pub contract_address: String,
    pub from: String,
    pub to: String,
    pub token_id: String,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub timestamp: u64,
}

impl TokenEvent {
    pub fn is_mint(&self) -> bool {
        self.from == ZERO_ADDRESS
    }

    pub fn is_burn(&self) -> bool {
        self.to == ZERO_ADDRESS
    }
}

/// Decoded marketplace listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEvent {
    pub chain_id: String,
    pub contract_address: String,
    pub seller: String,
    pub token_id: String,
    pub price: String,
    pub quantity: String,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub timestamp: u64,
}

/// Decoded marketplace purchase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseEvent {
    pub chain_id: String,
    pub contract_address: String,
    pub buyer: String,
    pub seller: String,
    pub token_id: String,
    pub quantity: String,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodedEvent {
    Transfer(TokenEvent),
    Listing(ListingEvent),
    Purchase(PurchaseEvent),
}

impl DecodedEvent {
    pub fn transaction_hash(&self) -> &str {
        match self {
            DecodedEvent::Transfer(e) => &e.transaction_hash,
            DecodedEvent::Listing(e) => &e.transaction_hash,
            DecodedEvent::Purchase(e) => &e.transaction_hash,
        }
    }
}

/// Balance observation for a single wallet, as reported by a wallet monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEvent {
    pub chain_id: String,
    pub wallet_address: String,
    pub contract_address: String,
    pub token_id: String,
    pub balance: String,
    pub block_number: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Syncing,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub latest_block: u64,
    pub sync_status: SyncStatus,
    pub peer_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenAttribute {
    pub trait_type: String,
    pub value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_type: Option<String>,
}

/// Token metadata in the shape shared by every chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub chain_id: String,
    pub contract_address: String,
    pub token_id: String,
    pub token_uri: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub attributes: Vec<TokenAttribute>,
    /// False when the URI could not be resolved to a document
    pub resolved: bool,
}

/// Unit of work handed to the worker pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockJob {
    pub chain_id: String,
    pub block_number: u64,
    /// Seconds since the unix epoch when the job was created
    pub timestamp: u64,
    pub priority: u32,
    /// Number of earlier failed attempts for this block
    pub attempt: u32,
    /// Progress generation of the chain when the job was issued
    pub epoch: u64,
}

/// Queue depth counters for one worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl QueueMetrics {
    /// Jobs currently owned by the worker
    pub fn depth(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }
}

/// Configuration for the coordinator and worker pool
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Number of block workers
    pub concurrency: usize,
    /// Failed attempts after which a block is dropped
    pub retry_limit: u32,
    /// A job running longer than this is reported as stalled
    pub stalled_timeout: Duration,
    /// Base delay before a retried job is picked up
    pub backoff_delay: Duration,
    /// Interval of the coordination loop
    pub coordination_interval: Duration,
    pub health_check_interval: Duration,
    /// Blocks per second a healthy chain is expected to sustain
    pub target_processing_rate: f64,
    pub max_concurrent_chains: usize,
    pub min_blocks_per_batch: u64,
    pub max_blocks_per_batch: u64,
    pub max_pending_blocks: usize,
    /// How far below the last verified block reorg recovery may search
    pub reorg_threshold: u64,
    pub worker_idle_timeout: Duration,
    pub worker_min_success_rate: f64,
}

impl CrawlerConfig {
    /// Build a configuration whose batch and scheduling limits follow from the worker count.
    pub fn with_concurrency(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let max_blocks_per_batch = (concurrency * 2) as u64;
        Self {
            concurrency,
            max_concurrent_chains: (concurrency / 2).max(1),
            min_blocks_per_batch: ((concurrency / 2) as u64).max(1),
            max_blocks_per_batch,
            max_pending_blocks: (max_blocks_per_batch * 4) as usize,
            ..Self::default_limits()
        }
    }

    fn default_limits() -> Self {
        Self {
            concurrency: 3,
            retry_limit: 5,
            stalled_timeout: Duration::from_millis(30_000),
            backoff_delay: Duration::from_millis(1_000),
            coordination_interval: Duration::from_millis(1_000),
            health_check_interval: Duration::from_millis(30_000),
            target_processing_rate: 10.0,
            max_concurrent_chains: 1,
            min_blocks_per_batch: 1,
            max_blocks_per_batch: 6,
            max_pending_blocks: 24,
            reorg_threshold: 64,
            worker_idle_timeout: Duration::from_secs(60),
            worker_min_success_rate: 0.7,
        }
    }

    pub fn validate(&self) -> CrawlResult<()> {
        if self.concurrency == 0 {
            return Err(CrawlError::Config("concurrency must be at least 1".to_string()));
        }
        if self.max_concurrent_chains == 0 {
            return Err(CrawlError::Config(
                "max_concurrent_chains must be at least 1".to_string(),
            ));
        }
        if self.min_blocks_per_batch == 0 || self.min_blocks_per_batch > self.max_blocks_per_batch {
            return Err(CrawlError::Config(format!(
                "invalid batch bounds [{}, {}]",
                self.min_blocks_per_batch, self.max_blocks_per_batch
            )));
        }
        if self.max_blocks_per_batch as usize > self.max_pending_blocks {
            return Err(CrawlError::Config(format!(
                "max_blocks_per_batch ({}) exceeds max_pending_blocks ({})",
                self.max_blocks_per_batch, self.max_pending_blocks
            )));
        }
        if self.coordination_interval.is_zero() || self.health_check_interval.is_zero() {
            return Err(CrawlError::Config("loop intervals must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self::with_concurrency(3)
    }
}

/// What a stored transaction record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Transfer,
    Listing,
    Purchase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingState {
    New,
    Processing,
    Processed,
    Failed,
    Retrying,
}

/// Persisted transaction, keyed by chain, transaction hash and log index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub chain_id: String,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub timestamp: u64,
    pub event_type: EventType,
    pub contract_address: String,
    pub token_id: String,
    pub from: String,
    pub to: String,
    pub price: Option<String>,
    pub quantity: Option<String>,
    pub processing_status: ProcessingState,
    pub processing_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Send,
    Receive,
    Mint,
    Burn,
    Approval,
    Listing,
    Purchase,
}

/// Persisted wallet activity, keyed by wallet, transaction hash, chain and activity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletActivity {
    pub wallet_address: String,
    pub user_id: Option<String>,
    pub chain_id: String,
    pub transaction_hash: String,
    pub activity_type: ActivityType,
    pub contract_address: String,
    pub token_id: String,
    pub counterparty: Option<String>,
    pub price: Option<String>,
    pub quantity: Option<String>,
    pub block_number: u64,
    pub timestamp: u64,
}

/// One ownership change in the global ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipTransfer {
    pub chain_id: String,
    pub contract_address: String,
    pub token_id: String,
    pub from: String,
    pub to: String,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
}

impl OwnershipTransfer {
    /// Natural key that makes repeated application a no-op
    pub fn key(&self) -> (String, String, u64) {
        (
            self.chain_id.clone(),
            self.transaction_hash.clone(),
            self.log_index,
        )
    }
}

/// Holding of a registered user's wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingRecord {
    pub user_id: String,
    pub wallet_address: String,
    pub chain_id: String,
    pub contract_address: String,
    pub token_id: String,
    pub balance: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFilter {
    pub chain_id: Option<String>,
    pub event_type: Option<EventType>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFilter {
    pub chain_id: Option<String>,
    pub activity_type: Option<ActivityType>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRegistration {
    pub address: String,
    pub user_id: String,
    pub active: bool,
}

/// Lowercase an address so registry and ledger keys compare equal across sources
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Seconds since the unix epoch
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

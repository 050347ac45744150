//! # Collaborator Traits
//!
//! The crawler engine talks to the outside world only through the traits in
//! this module, which keeps the coordinator, the worker pool and the event
//! processor testable against in-memory doubles.
//!
//! - [`ChainAdapter`]: one blockchain behind a uniform capability set
//! - [`AdapterBuilder`]: constructs adapters for the [`ChainAdapterFactory`](crate::ChainAdapterFactory)
//! - [`Storage`]: transaction, activity and ownership persistence
//! - [`WalletRegistry`]: which wallets belong to which users
//! - [`FailedUpdateStore`]: durable parking for updates that exhausted their retries
//! - [`PubSub`]: the library and store update channels
//! - [`JobDispatcher`]: the coordinator's view of the worker pool
//! - [`EventSink`]: where workers hand decoded events
//!
//! All traits use `async_trait` and are object safe so they can be shared as
//! `Arc<dyn Trait>` between tasks.

use async_trait::async_trait;
use primitive_types::U256;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::decode;
use crate::{
    ActivityFilter, Block, BlockJob, ChainConfig, ChainStatus, CrawlResult, DecodedEvent,
    FailedUpdate, HoldingRecord, ListingEvent, OwnershipTransfer, ProcessingState, PurchaseEvent,
    QueueMetrics, RawLog, TokenEvent, TokenMetadata, Transaction, TransactionFilter,
    TransactionReceipt, TransactionRecord, UpdateChannel, WalletActivity, WalletRegistration,
};

pub type WorkerId = usize;

/// Uniform access to one blockchain.
///
/// Network failures surface as [`CrawlError::ChainRpc`](crate::CrawlError::ChainRpc),
/// which callers treat as retryable. Legitimate absence of a block, transaction
/// or receipt is `Ok(None)`, so a pruned or reorged block is never confused with
/// a failing endpoint.
///
/// The event decoders have default implementations shared by every chain;
/// implementations differ only in fee estimation, confirmation defaults and
/// metadata normalization.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn config(&self) -> &ChainConfig;

    fn chain_id(&self) -> &str {
        &self.config().chain_id
    }

    /// Current chain head
    async fn get_latest_block(&self) -> CrawlResult<u64>;

    async fn get_block(&self, number: u64) -> CrawlResult<Option<Block>>;

    async fn get_transaction(&self, hash: &str) -> CrawlResult<Option<Transaction>>;

    async fn get_transaction_receipt(&self, hash: &str) -> CrawlResult<Option<TransactionReceipt>>;

    async fn is_contract_address(&self, address: &str) -> CrawlResult<bool>;

    /// Cheap connectivity probe, never fails
    async fn is_connected(&self) -> bool;

    async fn get_chain_status(&self) -> CrawlResult<ChainStatus>;

    /// Resolve token metadata. Unknown URI schemes yield a partial record.
    async fn get_token_metadata(
        &self,
        token_address: &str,
        token_id: &str,
    ) -> CrawlResult<TokenMetadata>;

    /// Estimated fee, in wei, for processing `transaction_count` transactions
    async fn estimate_processing_cost(&self, transaction_count: u64) -> CrawlResult<U256>;

    fn process_transfer_event(&self, log: &RawLog, timestamp: u64) -> CrawlResult<TokenEvent> {
        decode::decode_transfer(self.chain_id(), log, timestamp)
    }

    fn process_listing_event(&self, log: &RawLog, timestamp: u64) -> CrawlResult<ListingEvent> {
        decode::decode_listing(self.chain_id(), log, timestamp)
    }

    fn process_purchase_event(&self, log: &RawLog, timestamp: u64) -> CrawlResult<PurchaseEvent> {
        decode::decode_purchase(self.chain_id(), log, timestamp)
    }

    /// Try the three decoders; `Ok(None)` when the log is none of them.
    fn decode_log(&self, log: &RawLog, timestamp: u64) -> CrawlResult<Option<DecodedEvent>> {
        decode::decode_log(self.chain_id(), log, timestamp)
    }
}

/// Constructs the adapter for a configured chain
#[async_trait]
pub trait AdapterBuilder: Send + Sync {
    async fn build(&self, config: &ChainConfig) -> CrawlResult<Arc<dyn ChainAdapter>>;
}

/// Persistence collaborator.
///
/// Writes are upserts by natural key: `(chain, transaction hash, log index)`
/// for transactions and ownership transfers, `(wallet, transaction hash,
/// chain, activity type)` for wallet activity.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Upsert a transaction record. An existing record keeps its processing
    /// status and attempt count.
    async fn store_transaction(&self, record: TransactionRecord) -> CrawlResult<()>;

    /// Move a record to `status`. Entering [`ProcessingState::Processing`]
    /// counts as one processing attempt.
    async fn update_transaction_status(
        &self,
        chain_id: &str,
        transaction_hash: &str,
        log_index: u64,
        status: ProcessingState,
    ) -> CrawlResult<()>;

    async fn store_wallet_activity(&self, activity: WalletActivity) -> CrawlResult<()>;

    /// Apply an ownership transfer to the global ledger. Returns `false` when
    /// the transfer had already been applied.
    async fn record_transfer(&self, transfer: OwnershipTransfer) -> CrawlResult<bool>;

    async fn store_holding(&self, holding: HoldingRecord) -> CrawlResult<()>;

    async fn get_wallet_transactions(
        &self,
        address: &str,
        filter: &TransactionFilter,
    ) -> CrawlResult<Vec<TransactionRecord>>;

    async fn get_wallet_activity_history(
        &self,
        address: &str,
        filter: &ActivityFilter,
    ) -> CrawlResult<Vec<WalletActivity>>;

    /// Records in `New` or `Retrying` state with fewer than `max_attempts` attempts
    async fn get_pending_transactions(
        &self,
        limit: usize,
        max_attempts: u32,
    ) -> CrawlResult<Vec<TransactionRecord>>;
}

/// Wallet-to-user lookup and registration
#[async_trait]
pub trait WalletRegistry: Send + Sync {
    async fn get_user_id_for_wallet(&self, address: &str) -> CrawlResult<Option<String>>;

    /// Fails with [`CrawlError::WalletConflict`](crate::CrawlError::WalletConflict)
    /// when the address is actively registered to another user.
    async fn register_wallet(&self, address: &str, user_id: &str) -> CrawlResult<()>;

    /// Returns whether an active registration was removed
    async fn deregister_wallet(&self, address: &str) -> CrawlResult<bool>;

    async fn get_all_active_wallets(&self) -> CrawlResult<Vec<WalletRegistration>>;

    async fn get_wallets_for_user(&self, user_id: &str) -> CrawlResult<Vec<String>>;
}

/// Durable dead-letter store for updates
#[async_trait]
pub trait FailedUpdateStore: Send + Sync {
    /// Insert or overwrite the parked update with the same id
    async fn park(&self, failed: FailedUpdate) -> CrawlResult<()>;

    async fn list_failed(&self) -> CrawlResult<Vec<FailedUpdate>>;

    async fn remove(&self, id: &str) -> CrawlResult<()>;

    /// Move a parked update to the terminal dead set
    async fn bury(&self, failed: FailedUpdate) -> CrawlResult<()>;

    async fn list_dead(&self) -> CrawlResult<Vec<FailedUpdate>>;
}

/// JSON message bus with the two update channels
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: UpdateChannel, payload: String) -> CrawlResult<()>;

    async fn subscribe(&self, channel: UpdateChannel) -> CrawlResult<broadcast::Receiver<String>>;
}

/// Worker pool operations used by the coordinator
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Worker with the fewest queued and running jobs
    async fn get_block_worker(&self) -> CrawlResult<WorkerId>;

    async fn add_block_job(&self, worker_id: WorkerId, job: BlockJob) -> CrawlResult<()>;

    /// Replace a worker with a fresh one under the same id. Jobs queued on the
    /// old worker are discarded; the caller requeues them.
    async fn restart_worker(&self, worker_id: WorkerId) -> CrawlResult<()>;

    async fn worker_ids(&self) -> Vec<WorkerId>;

    async fn queue_metrics(&self) -> Vec<(WorkerId, QueueMetrics)>;
}

/// Domain handling for decoded events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle_event(&self, event: DecodedEvent) -> CrawlResult<()>;
}

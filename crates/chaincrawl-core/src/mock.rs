//! In-memory doubles for every collaborator trait.
//!
//! The mock chain keeps blocks in a map and derives hashes from the block
//! number plus a fork generation, so tests can rewrite history with
//! [`MockChainAdapter::fork_from`] and watch the coordinator roll back.

use async_trait::async_trait;
use primitive_types::U256;
use sha3::{Digest, Keccak256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::metadata::partial_metadata;
use crate::{
    normalize_address, ActivityFilter, AdapterBuilder, Block, BlockJob, ChainAdapter, ChainConfig,
    ChainStatus, CrawlError, CrawlResult, DecodedEvent, EventSink, FailedUpdate,
    FailedUpdateStore, HoldingRecord, JobDispatcher, OwnershipTransfer, ProcessingState, PubSub,
    QueueMetrics, RawLog, Storage, SyncStatus, TokenMetadata, Transaction, TransactionFilter,
    TransactionReceipt, TransactionRecord, UpdateChannel, WalletActivity, WalletRegistration,
    WalletRegistry, WorkerId,
};

/// Deterministic block hash for a block number on a given fork
pub fn mock_block_hash(number: u64, fork: u64) -> String {
    let digest = Keccak256::digest(format!("block:{}:{}", number, fork).as_bytes());
    format!("0x{}", hex::encode(digest))
}

#[derive(Default)]
struct MockChainState {
    blocks: BTreeMap<u64, Block>,
    forks: HashMap<u64, u64>,
    receipts: HashMap<String, TransactionReceipt>,
    failing_receipts: HashSet<String>,
    failing_blocks: HashMap<u64, u32>,
    latest: Option<u64>,
    latest_error: bool,
    block_latency: Duration,
}

/// Scriptable chain. Clones share state.
#[derive(Clone)]
pub struct MockChainAdapter {
    config: ChainConfig,
    state: Arc<RwLock<MockChainState>>,
    connected: Arc<AtomicBool>,
}

impl MockChainAdapter {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(MockChainState::default())),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    fn parent_hash(state: &MockChainState, number: u64) -> String {
        match number.checked_sub(1) {
            Some(parent) => state
                .blocks
                .get(&parent)
                .map(|b| b.hash.clone())
                .unwrap_or_else(|| mock_block_hash(parent, 0)),
            None => format!("0x{}", "0".repeat(64)),
        }
    }

    pub fn add_block(&self, number: u64, transactions: Vec<String>) {
        let mut state = self.state.write().unwrap();
        let fork = state.forks.get(&number).copied().unwrap_or(0);
        let block = Block {
            number,
            hash: mock_block_hash(number, fork),
            parent_hash: Self::parent_hash(&state, number),
            timestamp: 1_700_000_000 + number * 12,
            transactions,
        };
        state.blocks.insert(number, block);
    }

    /// Add empty blocks for every number in `range`
    pub fn add_blocks(&self, range: std::ops::RangeInclusive<u64>) {
        for number in range {
            self.add_block(number, vec![]);
        }
    }

    /// Add a block whose transactions carry the given logs
    pub fn add_block_with_logs(&self, number: u64, transactions: Vec<(&str, Vec<RawLog>)>) {
        let hashes = transactions.iter().map(|(h, _)| h.to_string()).collect();
        self.add_block(number, hashes);
        let mut state = self.state.write().unwrap();
        for (hash, logs) in transactions {
            state.receipts.insert(
                hash.to_string(),
                TransactionReceipt {
                    transaction_hash: hash.to_string(),
                    block_number: number,
                    status: true,
                    logs,
                },
            );
        }
    }

    pub fn append_transaction(&self, number: u64, hash: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(block) = state.blocks.get_mut(&number) {
            block.transactions.push(hash.to_string());
        }
    }

    pub fn remove_block(&self, number: u64) {
        self.state.write().unwrap().blocks.remove(&number);
    }

    /// Replace every block from `number` upward with a block on a new fork
    pub fn fork_from(&self, number: u64) {
        let mut state = self.state.write().unwrap();
        let numbers: Vec<u64> = state.blocks.range(number..).map(|(n, _)| *n).collect();
        for n in numbers {
            let fork = state.forks.get(&n).copied().unwrap_or(0) + 1;
            state.forks.insert(n, fork);
            let parent_hash = Self::parent_hash(&state, n);
            if let Some(block) = state.blocks.get_mut(&n) {
                block.hash = mock_block_hash(n, fork);
                block.parent_hash = parent_hash;
            }
        }
    }

    pub fn block_hash(&self, number: u64) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .blocks
            .get(&number)
            .map(|b| b.hash.clone())
    }

    pub fn set_latest(&self, latest: u64) {
        self.state.write().unwrap().latest = Some(latest);
    }

    pub fn set_latest_error(&self, failing: bool) {
        self.state.write().unwrap().latest_error = failing;
    }

    /// Fail the next `times` fetches of block `number` with an RPC error
    pub fn fail_block(&self, number: u64, times: u32) {
        self.state.write().unwrap().failing_blocks.insert(number, times);
    }

    pub fn fail_receipt(&self, hash: &str) {
        self.state
            .write()
            .unwrap()
            .failing_receipts
            .insert(hash.to_string());
    }

    pub fn set_block_latency(&self, latency: Duration) {
        self.state.write().unwrap().block_latency = latency;
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChainAdapter for MockChainAdapter {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    async fn get_latest_block(&self) -> CrawlResult<u64> {
        let state = self.state.read().unwrap();
        if state.latest_error {
            return Err(CrawlError::rpc(&self.config.chain_id, "head unavailable"));
        }
        Ok(state
            .latest
            .or_else(|| state.blocks.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn get_block(&self, number: u64) -> CrawlResult<Option<Block>> {
        let latency = self.state.read().unwrap().block_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.write().unwrap();
        if let Some(remaining) = state.failing_blocks.get_mut(&number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CrawlError::rpc(
                    &self.config.chain_id,
                    format!("block {} unavailable", number),
                ));
            }
        }
        Ok(state.blocks.get(&number).cloned())
    }

    async fn get_transaction(&self, hash: &str) -> CrawlResult<Option<Transaction>> {
        let state = self.state.read().unwrap();
        Ok(state.receipts.get(hash).map(|r| Transaction {
            hash: hash.to_string(),
            block_number: Some(r.block_number),
            from: r
                .logs
                .first()
                .map(|l| l.address.clone())
                .unwrap_or_default(),
            to: None,
            value: "0".to_string(),
        }))
    }

    async fn get_transaction_receipt(&self, hash: &str) -> CrawlResult<Option<TransactionReceipt>> {
        let state = self.state.read().unwrap();
        if state.failing_receipts.contains(hash) {
            return Err(CrawlError::rpc(
                &self.config.chain_id,
                format!("receipt {} unavailable", hash),
            ));
        }
        Ok(state.receipts.get(hash).cloned())
    }

    async fn is_contract_address(&self, address: &str) -> CrawlResult<bool> {
        let state = self.state.read().unwrap();
        Ok(state
            .receipts
            .values()
            .flat_map(|r| r.logs.iter())
            .any(|l| l.address.eq_ignore_ascii_case(address)))
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_chain_status(&self) -> CrawlResult<ChainStatus> {
        Ok(ChainStatus {
            latest_block: self.get_latest_block().await?,
            sync_status: SyncStatus::Synced,
            peer_count: 1,
        })
    }

    async fn get_token_metadata(
        &self,
        token_address: &str,
        token_id: &str,
    ) -> CrawlResult<TokenMetadata> {
        Ok(partial_metadata(
            &self.config.chain_id,
            token_address,
            token_id,
            "",
            None,
            None,
        ))
    }

    async fn estimate_processing_cost(&self, transaction_count: u64) -> CrawlResult<U256> {
        Ok(U256::from(21_000u64) * U256::from(transaction_count))
    }
}

/// Hands out pre-registered mock chains and counts how often it was asked.
#[derive(Clone, Default)]
pub struct MockAdapterBuilder {
    adapters: Arc<Mutex<HashMap<String, MockChainAdapter>>>,
    builds: Arc<AtomicUsize>,
}

impl MockAdapterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(self, adapter: MockChainAdapter) -> Self {
        self.adapters
            .lock()
            .unwrap()
            .insert(adapter.config.chain_id.clone(), adapter);
        self
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdapterBuilder for MockAdapterBuilder {
    async fn build(&self, config: &ChainConfig) -> CrawlResult<Arc<dyn ChainAdapter>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let adapter = self
            .adapters
            .lock()
            .unwrap()
            .get(&config.chain_id)
            .cloned()
            .ok_or_else(|| CrawlError::UnsupportedChain(config.chain_id.clone()))?;
        Ok(Arc::new(adapter))
    }
}

#[derive(Default)]
struct MockStorageState {
    transactions: BTreeMap<(String, String, u64), TransactionRecord>,
    activities: Vec<WalletActivity>,
    transfers: Vec<OwnershipTransfer>,
    holdings: Vec<HoldingRecord>,
}

/// Storage that records every write and can be switched off
pub struct MockStorage {
    state: Mutex<MockStorageState>,
    available: AtomicBool,
    failures_left: AtomicU32,
}

impl Default for MockStorage {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockStorageState::default()),
            available: AtomicBool::new(true),
            failures_left: AtomicU32::new(0),
        }
    }
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `count` writes, then recover
    pub fn fail_next_writes(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> CrawlResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CrawlError::Storage("storage unavailable".to_string()));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CrawlError::Storage("transient write failure".to_string()));
        }
        Ok(())
    }

    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.state.lock().unwrap().transactions.values().cloned().collect()
    }

    pub fn transaction(&self, chain_id: &str, hash: &str, log_index: u64) -> Option<TransactionRecord> {
        self.state
            .lock()
            .unwrap()
            .transactions
            .get(&(chain_id.to_string(), hash.to_string(), log_index))
            .cloned()
    }

    pub fn activities(&self) -> Vec<WalletActivity> {
        self.state.lock().unwrap().activities.clone()
    }

    pub fn transfers(&self) -> Vec<OwnershipTransfer> {
        self.state.lock().unwrap().transfers.clone()
    }

    pub fn holdings(&self) -> Vec<HoldingRecord> {
        self.state.lock().unwrap().holdings.clone()
    }
}

#[async_trait]
impl Storage for MockStorage {
    async fn store_transaction(&self, record: TransactionRecord) -> CrawlResult<()> {
        self.check_write()?;
        let mut state = self.state.lock().unwrap();
        let key = (
            record.chain_id.clone(),
            record.transaction_hash.clone(),
            record.log_index,
        );
        match state.transactions.get_mut(&key) {
            Some(existing) => {
                let (status, attempts) = (existing.processing_status, existing.processing_attempts);
                *existing = record;
                existing.processing_status = status;
                existing.processing_attempts = attempts;
            }
            None => {
                state.transactions.insert(key, record);
            }
        }
        Ok(())
    }

    async fn update_transaction_status(
        &self,
        chain_id: &str,
        transaction_hash: &str,
        log_index: u64,
        status: ProcessingState,
    ) -> CrawlResult<()> {
        self.check_write()?;
        let mut state = self.state.lock().unwrap();
        let record = state
            .transactions
            .get_mut(&(chain_id.to_string(), transaction_hash.to_string(), log_index))
            .ok_or_else(|| {
                CrawlError::Storage(format!("unknown transaction {}", transaction_hash))
            })?;
        if status == ProcessingState::Processing {
            record.processing_attempts += 1;
        }
        record.processing_status = status;
        Ok(())
    }

    async fn store_wallet_activity(&self, activity: WalletActivity) -> CrawlResult<()> {
        self.check_write()?;
        let mut state = self.state.lock().unwrap();
        state.activities.retain(|a| {
            !(a.wallet_address == activity.wallet_address
                && a.transaction_hash == activity.transaction_hash
                && a.chain_id == activity.chain_id
                && a.activity_type == activity.activity_type)
        });
        state.activities.push(activity);
        Ok(())
    }

    async fn record_transfer(&self, transfer: OwnershipTransfer) -> CrawlResult<bool> {
        self.check_write()?;
        let mut state = self.state.lock().unwrap();
        if state.transfers.iter().any(|t| t.key() == transfer.key()) {
            return Ok(false);
        }
        state.transfers.push(transfer);
        Ok(true)
    }

    async fn store_holding(&self, holding: HoldingRecord) -> CrawlResult<()> {
        self.check_write()?;
        let mut state = self.state.lock().unwrap();
        state.holdings.retain(|h| {
            !(h.wallet_address == holding.wallet_address
                && h.chain_id == holding.chain_id
                && h.contract_address == holding.contract_address
                && h.token_id == holding.token_id)
        });
        state.holdings.push(holding);
        Ok(())
    }

    async fn get_wallet_transactions(
        &self,
        address: &str,
        filter: &TransactionFilter,
    ) -> CrawlResult<Vec<TransactionRecord>> {
        let address = normalize_address(address);
        let state = self.state.lock().unwrap();
        Ok(state
            .transactions
            .values()
            .filter(|r| r.from == address || r.to == address)
            .filter(|r| filter.chain_id.as_ref().map_or(true, |c| &r.chain_id == c))
            .filter(|r| filter.event_type.map_or(true, |t| r.event_type == t))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn get_wallet_activity_history(
        &self,
        address: &str,
        filter: &ActivityFilter,
    ) -> CrawlResult<Vec<WalletActivity>> {
        let address = normalize_address(address);
        let state = self.state.lock().unwrap();
        Ok(state
            .activities
            .iter()
            .filter(|a| a.wallet_address == address)
            .filter(|a| filter.chain_id.as_ref().map_or(true, |c| &a.chain_id == c))
            .filter(|a| filter.activity_type.map_or(true, |t| a.activity_type == t))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn get_pending_transactions(
        &self,
        limit: usize,
        max_attempts: u32,
    ) -> CrawlResult<Vec<TransactionRecord>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CrawlError::Storage("storage unavailable".to_string()));
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .transactions
            .values()
            .filter(|r| {
                matches!(
                    r.processing_status,
                    ProcessingState::New | ProcessingState::Retrying
                ) && r.processing_attempts < max_attempts
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

pub struct MockWalletRegistry {
    wallets: Mutex<BTreeMap<String, WalletRegistration>>,
    available: AtomicBool,
}

impl Default for MockWalletRegistry {
    fn default() -> Self {
        Self {
            wallets: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MockWalletRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every lookup fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn with_wallet(self, address: &str, user_id: &str) -> Self {
        self.wallets.lock().unwrap().insert(
            normalize_address(address),
            WalletRegistration {
                address: normalize_address(address),
                user_id: user_id.to_string(),
                active: true,
            },
        );
        self
    }
}

#[async_trait]
impl WalletRegistry for MockWalletRegistry {
    async fn get_user_id_for_wallet(&self, address: &str) -> CrawlResult<Option<String>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CrawlError::Registry("wallet registry unavailable".to_string()));
        }
        Ok(self
            .wallets
            .lock()
            .unwrap()
            .get(&normalize_address(address))
            .filter(|w| w.active)
            .map(|w| w.user_id.clone()))
    }

    async fn register_wallet(&self, address: &str, user_id: &str) -> CrawlResult<()> {
        let address = normalize_address(address);
        let mut wallets = self.wallets.lock().unwrap();
        if let Some(existing) = wallets.get(&address) {
            if existing.active && existing.user_id != user_id {
                return Err(CrawlError::WalletConflict { address });
            }
        }
        wallets.insert(
            address.clone(),
            WalletRegistration {
                address,
                user_id: user_id.to_string(),
                active: true,
            },
        );
        Ok(())
    }

    async fn deregister_wallet(&self, address: &str) -> CrawlResult<bool> {
        let mut wallets = self.wallets.lock().unwrap();
        Ok(match wallets.get_mut(&normalize_address(address)) {
            Some(w) if w.active => {
                w.active = false;
                true
            }
            _ => false,
        })
    }

    async fn get_all_active_wallets(&self) -> CrawlResult<Vec<WalletRegistration>> {
        Ok(self
            .wallets
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.active)
            .cloned()
            .collect())
    }

    async fn get_wallets_for_user(&self, user_id: &str) -> CrawlResult<Vec<String>> {
        Ok(self
            .wallets
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.active && w.user_id == user_id)
            .map(|w| w.address.clone())
            .collect())
    }
}

#[derive(Default)]
pub struct MockFailedStore {
    parked: Mutex<BTreeMap<String, FailedUpdate>>,
    dead: Mutex<Vec<FailedUpdate>>,
}

impl MockFailedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FailedUpdateStore for MockFailedStore {
    async fn park(&self, failed: FailedUpdate) -> CrawlResult<()> {
        self.parked.lock().unwrap().insert(failed.id.clone(), failed);
        Ok(())
    }

    async fn list_failed(&self) -> CrawlResult<Vec<FailedUpdate>> {
        Ok(self.parked.lock().unwrap().values().cloned().collect())
    }

    async fn remove(&self, id: &str) -> CrawlResult<()> {
        self.parked.lock().unwrap().remove(id);
        Ok(())
    }

    async fn bury(&self, failed: FailedUpdate) -> CrawlResult<()> {
        self.parked.lock().unwrap().remove(&failed.id);
        self.dead.lock().unwrap().push(failed);
        Ok(())
    }

    async fn list_dead(&self) -> CrawlResult<Vec<FailedUpdate>> {
        Ok(self.dead.lock().unwrap().clone())
    }
}

/// Broadcast bus that also keeps a log of every publish
pub struct MockPubSub {
    library: broadcast::Sender<String>,
    store: broadcast::Sender<String>,
    published: Mutex<Vec<(UpdateChannel, String)>>,
    available: AtomicBool,
}

impl Default for MockPubSub {
    fn default() -> Self {
        Self {
            library: broadcast::channel(256).0,
            store: broadcast::channel(256).0,
            published: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MockPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn published(&self, channel: UpdateChannel) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn sender(&self, channel: UpdateChannel) -> &broadcast::Sender<String> {
        match channel {
            UpdateChannel::Library => &self.library,
            UpdateChannel::Store => &self.store,
        }
    }
}

#[async_trait]
impl PubSub for MockPubSub {
    async fn publish(&self, channel: UpdateChannel, payload: String) -> CrawlResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CrawlError::PubSub("bus unavailable".to_string()));
        }
        self.published.lock().unwrap().push((channel, payload.clone()));
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: UpdateChannel) -> CrawlResult<broadcast::Receiver<String>> {
        Ok(self.sender(channel).subscribe())
    }
}

/// Event sink that only remembers what it was given
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DecodedEvent>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<DecodedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn handle_event(&self, event: DecodedEvent) -> CrawlResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CrawlError::Storage("sink unavailable".to_string()));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Dispatcher that records jobs instead of running them.
///
/// Workers are assigned round-robin. Tests play the worker role by feeding
/// outcomes back into the coordinator.
pub struct RecordingDispatcher {
    workers: usize,
    next: AtomicUsize,
    jobs: Mutex<Vec<(WorkerId, BlockJob)>>,
    restarts: Mutex<Vec<WorkerId>>,
    metrics: Mutex<HashMap<WorkerId, QueueMetrics>>,
    rejecting: AtomicBool,
}

impl RecordingDispatcher {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            next: AtomicUsize::new(0),
            jobs: Mutex::new(Vec::new()),
            restarts: Mutex::new(Vec::new()),
            metrics: Mutex::new(HashMap::new()),
            rejecting: AtomicBool::new(false),
        }
    }

    /// Drain the jobs dispatched so far
    pub fn take_jobs(&self) -> Vec<(WorkerId, BlockJob)> {
        std::mem::take(&mut *self.jobs.lock().unwrap())
    }

    pub fn restarts(&self) -> Vec<WorkerId> {
        self.restarts.lock().unwrap().clone()
    }

    pub fn set_metrics(&self, worker_id: WorkerId, metrics: QueueMetrics) {
        self.metrics.lock().unwrap().insert(worker_id, metrics);
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobDispatcher for RecordingDispatcher {
    async fn get_block_worker(&self) -> CrawlResult<WorkerId> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst) % self.workers)
    }

    async fn add_block_job(&self, worker_id: WorkerId, job: BlockJob) -> CrawlResult<()> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(CrawlError::Queue("queue rejected job".to_string()));
        }
        self.jobs.lock().unwrap().push((worker_id, job));
        Ok(())
    }

    async fn restart_worker(&self, worker_id: WorkerId) -> CrawlResult<()> {
        self.restarts.lock().unwrap().push(worker_id);
        Ok(())
    }

    async fn worker_ids(&self) -> Vec<WorkerId> {
        (0..self.workers).collect()
    }

    async fn queue_metrics(&self) -> Vec<(WorkerId, QueueMetrics)> {
        let metrics = self.metrics.lock().unwrap();
        (0..self.workers)
            .map(|id| (id, metrics.get(&id).copied().unwrap_or_default()))
            .collect()
    }
}

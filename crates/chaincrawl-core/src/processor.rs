//! # Event Processor
//!
//! Turns decoded chain events into two kinds of domain updates:
//!
//! - **Library updates** change the holdings and activity of a registered
//!   user's wallet. They are only produced when the wallet is registered.
//! - **Store updates** change global token state: the ownership ledger, the
//!   transaction record and marketplace activity. Every transfer produces one,
//!   whoever the recipient is.
//!
//! Each persistence step is retried with exponential backoff. An update whose
//! retries are exhausted is parked in the [`FailedUpdateStore`] under a fresh
//! id and picked up again by [`EventProcessor::process_failed_updates`].
//!
//! Updates also arrive as JSON on the library and store channels of a
//! [`PubSub`] bus, published by wallet monitors outside the crawler.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::{
    unix_now, ActivityType, BalanceEvent, CrawlError, CrawlResult, DecodedEvent, EventSink,
    FailedUpdate, FailedUpdateStore, HoldingRecord, LibraryChange, LibraryUpdate, ListingEvent,
    OwnershipTransfer, ParkedUpdate, ProcessingState, PubSub, PurchaseEvent, Storage,
    StoreActivity, StoreUpdate, TokenEvent, UpdateChannel, WalletActivity, WalletRegistry,
    ZERO_ADDRESS,
};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Retries of a single persistence step after its first attempt
    pub retry_limit: u32,
    pub retry_delay: Duration,
    /// Failed recovery passes after which a parked update is given up on
    pub max_recovery_attempts: u32,
    /// Persisted transactions re-driven per recovery pass
    pub pending_batch_size: usize,
    pub pending_max_attempts: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_delay: Duration::from_millis(5_000),
            max_recovery_attempts: 10,
            pending_batch_size: 20,
            pending_max_attempts: 3,
        }
    }
}

impl ProcessorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_limit, self.retry_delay)
    }
}

#[derive(Debug, Default)]
pub struct ProcessingStatus {
    success: AtomicU64,
    failures: AtomicU64,
    pending: AtomicU64,
    last_processed_timestamp: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingStatusSnapshot {
    pub success: u64,
    pub failures: u64,
    /// Updates currently being persisted
    pub pending: u64,
    pub last_processed_timestamp: u64,
}

impl ProcessingStatus {
    pub fn snapshot(&self) -> ProcessingStatusSnapshot {
        ProcessingStatusSnapshot {
            success: self.success.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            pending: self.pending.load(Ordering::SeqCst),
            last_processed_timestamp: self.last_processed_timestamp.load(Ordering::SeqCst),
        }
    }

    fn begin(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn fail(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self, success: bool) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
        if success {
            self.success.fetch_add(1, Ordering::SeqCst);
            self.last_processed_timestamp
                .store(unix_now(), Ordering::SeqCst);
        } else {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Emitted after an update has been persisted
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorNotification {
    LibraryUpdated(LibraryUpdate),
    StoreUpdated(StoreUpdate),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// Parked in the failed store under this id
    Parked(String),
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub store: UpdateOutcome,
    /// `None` when the recipient is not a registered wallet. Parked when
    /// the registry could not be reached.
    pub library: Option<UpdateOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub still_failed: usize,
    pub buried: usize,
    pub pending_reprocessed: usize,
    pub pending_failed: usize,
}

pub struct EventProcessor {
    config: ProcessorConfig,
    storage: Arc<dyn Storage>,
    registry: Arc<dyn WalletRegistry>,
    failed: Arc<dyn FailedUpdateStore>,
    status: ProcessingStatus,
    notifications: broadcast::Sender<ProcessorNotification>,
}

impl EventProcessor {
    pub fn new(
        config: ProcessorConfig,
        storage: Arc<dyn Storage>,
        registry: Arc<dyn WalletRegistry>,
        failed: Arc<dyn FailedUpdateStore>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(1024);
        Self {
            config,
            storage,
            registry,
            failed,
            status: ProcessingStatus::default(),
            notifications,
        }
    }

    pub fn status(&self) -> ProcessingStatusSnapshot {
        self.status.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessorNotification> {
        self.notifications.subscribe()
    }

    async fn lookup_user(&self, address: &str) -> CrawlResult<Option<String>> {
        let registry = self.registry.as_ref();
        retry_with_backoff(
            &self.config.retry_policy(),
            "wallet lookup",
            move || registry.get_user_id_for_wallet(address),
        )
        .await
    }

    /// Global store update always; library update only for a registered recipient.
    pub async fn process_transfer_event(&self, event: &TokenEvent) -> CrawlResult<TransferOutcome> {
        let store = self.apply_store_update(&StoreUpdate::from(event)).await?;
        let library = if event.is_burn() {
            None
        } else {
            match self.lookup_user(&event.to).await {
                Ok(Some(user_id)) => {
                    let update = LibraryUpdate::for_recipient(&user_id, event);
                    Some(self.apply_library_update(&update).await?)
                }
                Ok(None) => {
                    debug!(
                        "[{}] recipient {} of {} is not registered",
                        event.chain_id, event.to, event.transaction_hash
                    );
                    None
                }
                Err(e) => {
                    self.status.fail();
                    Some(self.park(ParkedUpdate::Recipient(event.clone()), &e).await?)
                }
            }
        };
        Ok(TransferOutcome { store, library })
    }

    pub async fn process_listing_event(&self, event: &ListingEvent) -> CrawlResult<UpdateOutcome> {
        self.apply_store_update(&StoreUpdate::from(event)).await
    }

    pub async fn process_purchase_event(&self, event: &PurchaseEvent) -> CrawlResult<UpdateOutcome> {
        self.apply_store_update(&StoreUpdate::from(event)).await
    }

    /// Balance reported by a wallet monitor; ignored for unregistered wallets.
    pub async fn process_balance_event(
        &self,
        event: &BalanceEvent,
    ) -> CrawlResult<Option<UpdateOutcome>> {
        match self.lookup_user(&event.wallet_address).await {
            Ok(Some(user_id)) => {
                let update = LibraryUpdate::for_balance(&user_id, event);
                Ok(Some(self.apply_library_update(&update).await?))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.status.fail();
                Ok(Some(self.park(ParkedUpdate::Balance(event.clone()), &e).await?))
            }
        }
    }

    /// Persist a store update, parking it when retries are exhausted.
    ///
    /// Only a failure to park is returned as an error.
    pub async fn apply_store_update(&self, update: &StoreUpdate) -> CrawlResult<UpdateOutcome> {
        self.status.begin();
        let result = self.persist_store_update(update).await;
        self.status.finish(result.is_ok());
        match result {
            Ok(()) => {
                let _ = self
                    .notifications
                    .send(ProcessorNotification::StoreUpdated(update.clone()));
                Ok(UpdateOutcome::Applied)
            }
            Err(e) => {
                self.set_record_status(update, ProcessingState::Retrying)
                    .await;
                self.park(ParkedUpdate::Store(update.clone()), &e).await
            }
        }
    }

    pub async fn apply_library_update(&self, update: &LibraryUpdate) -> CrawlResult<UpdateOutcome> {
        self.status.begin();
        let result = self.persist_library_update(update).await;
        self.status.finish(result.is_ok());
        match result {
            Ok(()) => {
                let _ = self
                    .notifications
                    .send(ProcessorNotification::LibraryUpdated(update.clone()));
                Ok(UpdateOutcome::Applied)
            }
            Err(e) => self.park(ParkedUpdate::Library(update.clone()), &e).await,
        }
    }

    async fn persist_store_update(&self, update: &StoreUpdate) -> CrawlResult<()> {
        let policy = self.config.retry_policy();
        let storage = self.storage.as_ref();
        let chain_id = update.chain_id.as_str();
        let tx_hash = update.transaction_hash.as_str();
        let log_index = update.log_index;

        let record = update.to_record();
        retry_with_backoff(&policy, "store transaction", move || {
            storage.store_transaction(record.clone())
        })
        .await?;
        retry_with_backoff(&policy, "mark transaction processing", move || {
            storage.update_transaction_status(chain_id, tx_hash, log_index, ProcessingState::Processing)
        })
        .await?;

        match &update.activity {
            StoreActivity::Transfer => {
                let transfer = OwnershipTransfer {
                    chain_id: update.chain_id.clone(),
                    contract_address: update.contract_address.clone(),
                    token_id: update.token_id.clone(),
                    from: update.from.clone(),
                    to: update.to.clone(),
                    transaction_hash: update.transaction_hash.clone(),
                    log_index,
                    block_number: update.block_number,
                };
                let applied = retry_with_backoff(&policy, "record transfer", move || {
                    storage.record_transfer(transfer.clone())
                })
                .await?;
                if !applied {
                    debug!(
                        "[{}] transfer {}#{} already in ledger",
                        chain_id, tx_hash, log_index
                    );
                }
            }
            StoreActivity::Listing { price, quantity } => {
                let activity = WalletActivity {
                    wallet_address: update.from.clone(),
                    user_id: self.lookup_user(&update.from).await?,
                    chain_id: update.chain_id.clone(),
                    transaction_hash: update.transaction_hash.clone(),
                    activity_type: ActivityType::Listing,
                    contract_address: update.contract_address.clone(),
                    token_id: update.token_id.clone(),
                    counterparty: None,
                    price: Some(price.clone()),
                    quantity: Some(quantity.clone()),
                    block_number: update.block_number,
                    timestamp: update.timestamp,
                };
                retry_with_backoff(&policy, "store listing activity", move || {
                    storage.store_wallet_activity(activity.clone())
                })
                .await?;
            }
            // ownership moves with the Transfer log emitted in the same transaction
            StoreActivity::Purchase { quantity } => {
                let activity = WalletActivity {
                    wallet_address: update.to.clone(),
                    user_id: self.lookup_user(&update.to).await?,
                    chain_id: update.chain_id.clone(),
                    transaction_hash: update.transaction_hash.clone(),
                    activity_type: ActivityType::Purchase,
                    contract_address: update.contract_address.clone(),
                    token_id: update.token_id.clone(),
                    counterparty: Some(update.from.clone()),
                    price: None,
                    quantity: Some(quantity.clone()),
                    block_number: update.block_number,
                    timestamp: update.timestamp,
                };
                retry_with_backoff(&policy, "store purchase activity", move || {
                    storage.store_wallet_activity(activity.clone())
                })
                .await?;
            }
        }

        retry_with_backoff(&policy, "mark transaction processed", move || {
            storage.update_transaction_status(chain_id, tx_hash, log_index, ProcessingState::Processed)
        })
        .await
    }

    async fn persist_library_update(&self, update: &LibraryUpdate) -> CrawlResult<()> {
        let policy = self.config.retry_policy();
        let storage = self.storage.as_ref();
        match &update.change {
            LibraryChange::Activity {
                activity_type,
                transaction_hash,
                counterparty,
            } => {
                let activity = WalletActivity {
                    wallet_address: update.wallet_address.clone(),
                    user_id: Some(update.user_id.clone()),
                    chain_id: update.chain_id.clone(),
                    transaction_hash: transaction_hash.clone(),
                    activity_type: *activity_type,
                    contract_address: update.contract_address.clone(),
                    token_id: update.token_id.clone(),
                    counterparty: counterparty.clone().filter(|c| c != ZERO_ADDRESS),
                    price: None,
                    quantity: None,
                    block_number: update.block_number,
                    timestamp: update.timestamp,
                };
                retry_with_backoff(&policy, "store wallet activity", move || {
                    storage.store_wallet_activity(activity.clone())
                })
                .await
            }
            LibraryChange::Balance { balance } => {
                let holding = HoldingRecord {
                    user_id: update.user_id.clone(),
                    wallet_address: update.wallet_address.clone(),
                    chain_id: update.chain_id.clone(),
                    contract_address: update.contract_address.clone(),
                    token_id: update.token_id.clone(),
                    balance: balance.clone(),
                    block_number: update.block_number,
                };
                retry_with_backoff(&policy, "store holding", move || {
                    storage.store_holding(holding.clone())
                })
                .await
            }
        }
    }

    /// Best effort; the record may not exist if storing it was what failed.
    async fn set_record_status(&self, update: &StoreUpdate, status: ProcessingState) {
        if let Err(e) = self
            .storage
            .update_transaction_status(
                &update.chain_id,
                &update.transaction_hash,
                update.log_index,
                status,
            )
            .await
        {
            debug!(
                "[{}] could not mark {}#{} {:?}: {}",
                update.chain_id, update.transaction_hash, update.log_index, status, e
            );
        }
    }

    async fn park(&self, update: ParkedUpdate, cause: &CrawlError) -> CrawlResult<UpdateOutcome> {
        let failed = FailedUpdate {
            id: uuid::Uuid::new_v4().to_string(),
            update,
            error: cause.to_string(),
            failed_at: unix_now(),
            recovery_attempts: 0,
        };
        let id = failed.id.clone();
        let namespace = failed.update.channel().failed_namespace();
        match self.failed.park(failed).await {
            Ok(()) => {
                warn!("Parked update {}/{} after: {}", namespace, id, cause);
                Ok(UpdateOutcome::Parked(id))
            }
            Err(e) => {
                error!("Could not park failed update ({}): {}", cause, e);
                Err(e)
            }
        }
    }

    /// Persist a parked update again.
    ///
    /// Updates parked before their wallet was resolved look the wallet up
    /// first; one that turns out unregistered has nothing left to apply.
    async fn replay_parked(&self, update: &ParkedUpdate) -> CrawlResult<Option<ProcessorNotification>> {
        match update {
            ParkedUpdate::Library(update) => {
                self.persist_library_update(update).await?;
                Ok(Some(ProcessorNotification::LibraryUpdated(update.clone())))
            }
            ParkedUpdate::Store(update) => {
                self.persist_store_update(update).await?;
                Ok(Some(ProcessorNotification::StoreUpdated(update.clone())))
            }
            ParkedUpdate::Recipient(event) => match self.lookup_user(&event.to).await? {
                Some(user_id) => {
                    let update = LibraryUpdate::for_recipient(&user_id, event);
                    self.persist_library_update(&update).await?;
                    Ok(Some(ProcessorNotification::LibraryUpdated(update)))
                }
                None => Ok(None),
            },
            ParkedUpdate::Balance(event) => match self.lookup_user(&event.wallet_address).await? {
                Some(user_id) => {
                    let update = LibraryUpdate::for_balance(&user_id, event);
                    self.persist_library_update(&update).await?;
                    Ok(Some(ProcessorNotification::LibraryUpdated(update)))
                }
                None => Ok(None),
            },
        }
    }

    /// Re-drive every parked update and a batch of unfinished transaction records.
    pub async fn process_failed_updates(&self) -> CrawlResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut recovered_keys = HashSet::new();

        for mut parked in self.failed.list_failed().await? {
            match self.replay_parked(&parked.update).await {
                Ok(notification) => {
                    self.failed.remove(&parked.id).await?;
                    report.recovered += 1;
                    self.status.finish(true);
                    if let ParkedUpdate::Store(update) = &parked.update {
                        recovered_keys.insert((
                            update.chain_id.clone(),
                            update.transaction_hash.clone(),
                            update.log_index,
                        ));
                    }
                    if let Some(notification) = notification {
                        let _ = self.notifications.send(notification);
                    }
                }
                Err(e) => {
                    parked.recovery_attempts += 1;
                    parked.error = e.to_string();
                    if parked.recovery_attempts >= self.config.max_recovery_attempts {
                        error!(
                            "Giving up on update {} after {} recovery attempts: {}",
                            parked.id, parked.recovery_attempts, e
                        );
                        self.failed.bury(parked).await?;
                        report.buried += 1;
                    } else {
                        self.failed.park(parked).await?;
                        report.still_failed += 1;
                    }
                }
            }
        }

        let pending = match self
            .storage
            .get_pending_transactions(
                self.config.pending_batch_size,
                self.config.pending_max_attempts,
            )
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Could not load unfinished transaction records: {}", e);
                Vec::new()
            }
        };
        for record in pending {
            let key = (
                record.chain_id.clone(),
                record.transaction_hash.clone(),
                record.log_index,
            );
            if recovered_keys.contains(&key) {
                continue;
            }
            let update = StoreUpdate::from_record(&record);
            match self.persist_store_update(&update).await {
                Ok(()) => report.pending_reprocessed += 1,
                Err(e) => {
                    report.pending_failed += 1;
                    let status = if record.processing_attempts + 1 >= self.config.pending_max_attempts {
                        ProcessingState::Failed
                    } else {
                        ProcessingState::Retrying
                    };
                    warn!(
                        "[{}] reprocessing {}#{} failed ({:?}): {}",
                        record.chain_id, record.transaction_hash, record.log_index, status, e
                    );
                    self.set_record_status(&update, status).await;
                }
            }
        }

        if report != RecoveryReport::default() {
            info!(
                "Recovery pass: {} recovered, {} still parked, {} buried, {} records reprocessed, {} records failed",
                report.recovered,
                report.still_failed,
                report.buried,
                report.pending_reprocessed,
                report.pending_failed
            );
        }
        Ok(report)
    }

    /// Run [`process_failed_updates`](Self::process_failed_updates) on a fixed interval
    pub async fn run_recovery(self: Arc<Self>, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = self.process_failed_updates().await {
                warn!("Recovery pass failed: {}", e);
            }
        }
    }

    /// Apply one JSON update received on `channel`
    pub async fn handle_bus_message(
        &self,
        channel: UpdateChannel,
        payload: &str,
    ) -> CrawlResult<UpdateOutcome> {
        match channel {
            UpdateChannel::Library => {
                let update: LibraryUpdate = serde_json::from_str(payload)?;
                self.apply_library_update(&update).await
            }
            UpdateChannel::Store => {
                let update: StoreUpdate = serde_json::from_str(payload)?;
                self.apply_store_update(&update).await
            }
        }
    }

    /// Subscribe to both update channels; one task per channel.
    pub async fn run_subscriptions(
        self: &Arc<Self>,
        pubsub: &dyn PubSub,
    ) -> CrawlResult<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(2);
        for channel in [UpdateChannel::Library, UpdateChannel::Store] {
            let mut receiver = pubsub.subscribe(channel).await?;
            let processor = Arc::clone(self);
            info!("Subscribed to {}", channel.topic());
            handles.push(tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => {
                            if let Err(e) = processor.handle_bus_message(channel, &payload).await {
                                warn!("Dropping message on {}: {}", channel.topic(), e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("{} subscriber lagged, {} messages skipped", channel.topic(), skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("{} closed", channel.topic());
                            break;
                        }
                    }
                }
            }));
        }
        Ok(handles)
    }
}

#[async_trait]
impl EventSink for EventProcessor {
    async fn handle_event(&self, event: DecodedEvent) -> CrawlResult<()> {
        match &event {
            DecodedEvent::Transfer(transfer) => {
                self.process_transfer_event(transfer).await?;
            }
            DecodedEvent::Listing(listing) => {
                self.process_listing_event(listing).await?;
            }
            DecodedEvent::Purchase(purchase) => {
                self.process_purchase_event(purchase).await?;
            }
        }
        Ok(())
    }
}

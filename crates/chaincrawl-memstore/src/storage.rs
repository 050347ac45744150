use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use chaincrawl_core::{
    normalize_address, ActivityFilter, ActivityType, CrawlError, CrawlResult, HoldingRecord,
    OwnershipTransfer, ProcessingState, Storage, TransactionFilter, TransactionRecord,
    WalletActivity,
};

use crate::ledger::TokenLedger;

type TransactionKey = (String, String, u64);
type ActivityKey = (String, String, String, ActivityType);
/// `(wallet, chain, contract, token id)`
type HoldingKey = (String, String, String, String);

#[derive(Default)]
struct Tables {
    transactions: HashMap<TransactionKey, TransactionRecord>,
    activities: HashMap<ActivityKey, WalletActivity>,
    holdings: HashMap<HoldingKey, HoldingRecord>,
    ledger: TokenLedger,
}

/// In-memory [`Storage`] backed by hash maps and a [`TokenLedger`].
///
/// Can be switched offline with [`set_available`](Self::set_available) to
/// exercise the retry and dead-letter paths.
pub struct MemStorage {
    tables: RwLock<Tables>,
    available: AtomicBool,
}

impl Default for MemStorage {
    fn default() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> CrawlResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CrawlError::Storage("store is offline".to_string()))
        }
    }

    pub async fn transaction(
        &self,
        chain_id: &str,
        transaction_hash: &str,
        log_index: u64,
    ) -> Option<TransactionRecord> {
        self.tables
            .read()
            .await
            .transactions
            .get(&(chain_id.to_string(), transaction_hash.to_string(), log_index))
            .cloned()
    }

    pub async fn transaction_count(&self) -> usize {
        self.tables.read().await.transactions.len()
    }

    pub async fn holdings_for_user(&self, user_id: &str) -> Vec<HoldingRecord> {
        let mut holdings: Vec<_> = self
            .tables
            .read()
            .await
            .holdings
            .values()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect();
        holdings.sort_by(|a, b| {
            (&a.chain_id, &a.contract_address, &a.token_id)
                .cmp(&(&b.chain_id, &b.contract_address, &b.token_id))
        });
        holdings
    }

    pub async fn owner_of(&self, chain_id: &str, contract: &str, token_id: &str) -> Option<String> {
        self.tables
            .read()
            .await
            .ledger
            .owner_of(chain_id, contract, token_id)
            .map(str::to_string)
    }

    pub async fn balance_of(&self, chain_id: &str, contract: &str, holder: &str) -> u64 {
        self.tables.read().await.ledger.balance_of(chain_id, contract, holder)
    }

    pub async fn total_supply(&self, chain_id: &str, contract: &str) -> u64 {
        self.tables.read().await.ledger.total_supply(chain_id, contract)
    }

    pub async fn holders(&self, chain_id: &str, contract: &str) -> Vec<(String, u64)> {
        self.tables.read().await.ledger.holders(chain_id, contract)
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn store_transaction(&self, record: TransactionRecord) -> CrawlResult<()> {
        self.check_available()?;
        let key = (
            record.chain_id.clone(),
            record.transaction_hash.clone(),
            record.log_index,
        );
        let mut tables = self.tables.write().await;
        match tables.transactions.get_mut(&key) {
            Some(existing) => {
                let status = existing.processing_status;
                let attempts = existing.processing_attempts;
                *existing = record;
                existing.processing_status = status;
                existing.processing_attempts = attempts;
            }
            None => {
                tables.transactions.insert(key, record);
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
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let record = tables
            .transactions
            .get_mut(&(chain_id.to_string(), transaction_hash.to_string(), log_index))
            .ok_or_else(|| {
                CrawlError::Storage(format!(
                    "no transaction {}#{} on {}",
                    transaction_hash, log_index, chain_id
                ))
            })?;
        if status == ProcessingState::Processing {
            record.processing_attempts += 1;
        }
        record.processing_status = status;
        Ok(())
    }

    async fn store_wallet_activity(&self, activity: WalletActivity) -> CrawlResult<()> {
        self.check_available()?;
        let key = (
            normalize_address(&activity.wallet_address),
            activity.transaction_hash.clone(),
            activity.chain_id.clone(),
            activity.activity_type,
        );
        self.tables.write().await.activities.insert(key, activity);
        Ok(())
    }

    async fn record_transfer(&self, transfer: OwnershipTransfer) -> CrawlResult<bool> {
        self.check_available()?;
        let applied = self.tables.write().await.ledger.apply(&transfer);
        if !applied {
            debug!(
                "[{}] transfer {}#{} already applied",
                transfer.chain_id, transfer.transaction_hash, transfer.log_index
            );
        }
        Ok(applied)
    }

    async fn store_holding(&self, holding: HoldingRecord) -> CrawlResult<()> {
        self.check_available()?;
        let key = (
            normalize_address(&holding.wallet_address),
            holding.chain_id.clone(),
            normalize_address(&holding.contract_address),
            holding.token_id.clone(),
        );
        let mut tables = self.tables.write().await;
        if holding.balance == "0" {
            tables.holdings.remove(&key);
        } else {
            tables.holdings.insert(key, holding);
        }
        Ok(())
    }

    async fn get_wallet_transactions(
        &self,
        address: &str,
        filter: &TransactionFilter,
    ) -> CrawlResult<Vec<TransactionRecord>> {
        self.check_available()?;
        let address = normalize_address(address);
        let mut records: Vec<_> = self
            .tables
            .read()
            .await
            .transactions
            .values()
            .filter(|r| normalize_address(&r.from) == address || normalize_address(&r.to) == address)
            .filter(|r| filter.chain_id.as_ref().map_or(true, |c| &r.chain_id == c))
            .filter(|r| filter.event_type.map_or(true, |t| r.event_type == t))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.block_number
                .cmp(&a.block_number)
                .then(b.log_index.cmp(&a.log_index))
        });
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn get_wallet_activity_history(
        &self,
        address: &str,
        filter: &ActivityFilter,
    ) -> CrawlResult<Vec<WalletActivity>> {
        self.check_available()?;
        let address = normalize_address(address);
        let mut activities: Vec<_> = self
            .tables
            .read()
            .await
            .activities
            .iter()
            .filter(|(key, _)| key.0 == address)
            .map(|(_, a)| a)
            .filter(|a| filter.chain_id.as_ref().map_or(true, |c| &a.chain_id == c))
            .filter(|a| filter.activity_type.map_or(true, |t| a.activity_type == t))
            .cloned()
            .collect();
        activities.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.block_number.cmp(&a.block_number)));
        if let Some(limit) = filter.limit {
            activities.truncate(limit);
        }
        Ok(activities)
    }

    async fn get_pending_transactions(
        &self,
        limit: usize,
        max_attempts: u32,
    ) -> CrawlResult<Vec<TransactionRecord>> {
        self.check_available()?;
        let mut pending: Vec<_> = self
            .tables
            .read()
            .await
            .transactions
            .values()
            .filter(|r| {
                matches!(
                    r.processing_status,
                    ProcessingState::New | ProcessingState::Retrying
                ) && r.processing_attempts < max_attempts
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            (a.block_number, a.log_index).cmp(&(b.block_number, b.log_index))
        });
        pending.truncate(limit);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaincrawl_core::{EventType, ZERO_ADDRESS};

    const CONTRACT: &str = "0x5555555555555555555555555555555555555555";
    const ALICE: &str = "0xAAAAaaaaAAAAaaaaAAAAaaaaAAAAaaaaAAAAaaaa";
    const BOB: &str = "0x2222222222222222222222222222222222222222";

    fn record(tx: &str, log_index: u64, block: u64, from: &str, to: &str) -> TransactionRecord {
        TransactionRecord {
            chain_id: "ethereum".into(),
            transaction_hash: tx.into(),
            log_index,
            block_number: block,
            timestamp: block * 12,
            event_type: EventType::Transfer,
            contract_address: CONTRACT.into(),
            token_id: "1".into(),
            from: from.into(),
            to: to.into(),
            price: None,
            quantity: None,
            processing_status: ProcessingState::New,
            processing_attempts: 0,
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_processing_bookkeeping() {
        let storage = MemStorage::new();
        storage.store_transaction(record("0xt1", 0, 5, ALICE, BOB)).await.unwrap();
        storage
            .update_transaction_status("ethereum", "0xt1", 0, ProcessingState::Processing)
            .await
            .unwrap();
        storage.store_transaction(record("0xt1", 0, 5, ALICE, BOB)).await.unwrap();

        let stored = storage.transaction("ethereum", "0xt1", 0).await.unwrap();
        assert_eq!(stored.processing_status, ProcessingState::Processing);
        assert_eq!(stored.processing_attempts, 1);
        assert_eq!(storage.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_logs_of_one_transaction_are_distinct_records() {
        let storage = MemStorage::new();
        storage.store_transaction(record("0xt1", 0, 5, ALICE, BOB)).await.unwrap();
        storage.store_transaction(record("0xt1", 1, 5, BOB, ALICE)).await.unwrap();
        assert_eq!(storage.transaction_count().await, 2);
    }

    #[tokio::test]
    async fn test_status_update_of_unknown_record_fails() {
        let storage = MemStorage::new();
        let result = storage
            .update_transaction_status("ethereum", "0xmissing", 0, ProcessingState::Processed)
            .await;
        assert!(matches!(result, Err(CrawlError::Storage(_))));
    }

    #[tokio::test]
    async fn test_wallet_transactions_match_case_insensitively() {
        let storage = MemStorage::new();
        storage.store_transaction(record("0xt1", 0, 5, ZERO_ADDRESS, ALICE)).await.unwrap();
        storage.store_transaction(record("0xt2", 0, 9, ALICE, BOB)).await.unwrap();
        storage.store_transaction(record("0xt3", 0, 7, BOB, ZERO_ADDRESS)).await.unwrap();

        let found = storage
            .get_wallet_transactions(&ALICE.to_lowercase(), &TransactionFilter::default())
            .await
            .unwrap();
        let hashes: Vec<_> = found.iter().map(|r| r.transaction_hash.as_str()).collect();
        assert_eq!(hashes, vec!["0xt2", "0xt1"]);

        let limited = storage
            .get_wallet_transactions(
                BOB,
                &TransactionFilter {
                    limit: Some(1),
                    ..TransactionFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(limited[0].transaction_hash, "0xt2");
    }

    #[tokio::test]
    async fn test_pending_transactions_respect_status_and_attempts() {
        let storage = MemStorage::new();
        for (i, tx) in ["0xa", "0xb", "0xc", "0xd"].iter().enumerate() {
            storage
                .store_transaction(record(tx, 0, 10 - i as u64, ALICE, BOB))
                .await
                .unwrap();
        }
        storage
            .update_transaction_status("ethereum", "0xb", 0, ProcessingState::Processed)
            .await
            .unwrap();
        for _ in 0..3 {
            storage
                .update_transaction_status("ethereum", "0xc", 0, ProcessingState::Processing)
                .await
                .unwrap();
        }
        storage
            .update_transaction_status("ethereum", "0xc", 0, ProcessingState::Retrying)
            .await
            .unwrap();

        let pending = storage.get_pending_transactions(10, 3).await.unwrap();
        let hashes: Vec<_> = pending.iter().map(|r| r.transaction_hash.as_str()).collect();
        assert_eq!(hashes, vec!["0xd", "0xa"]);
        assert_eq!(storage.get_pending_transactions(1, 3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_activity_upsert_is_keyed_by_type() {
        let storage = MemStorage::new();
        let activity = |activity_type| WalletActivity {
            wallet_address: ALICE.into(),
            user_id: Some("user-1".into()),
            chain_id: "ethereum".into(),
            transaction_hash: "0xt1".into(),
            activity_type,
            contract_address: CONTRACT.into(),
            token_id: "1".into(),
            counterparty: None,
            price: None,
            quantity: None,
            block_number: 5,
            timestamp: 60,
        };
        storage.store_wallet_activity(activity(ActivityType::Receive)).await.unwrap();
        storage.store_wallet_activity(activity(ActivityType::Receive)).await.unwrap();
        storage.store_wallet_activity(activity(ActivityType::Purchase)).await.unwrap();

        let history = storage
            .get_wallet_activity_history(ALICE, &ActivityFilter::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        let purchases = storage
            .get_wallet_activity_history(
                ALICE,
                &ActivityFilter {
                    activity_type: Some(ActivityType::Purchase),
                    ..ActivityFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(purchases.len(), 1);
    }

    #[tokio::test]
    async fn test_transfers_feed_the_ledger_once() {
        let storage = MemStorage::new();
        let mint = OwnershipTransfer {
            chain_id: "ethereum".into(),
            contract_address: CONTRACT.into(),
            token_id: "9".into(),
            from: ZERO_ADDRESS.into(),
            to: BOB.into(),
            transaction_hash: "0xmint".into(),
            log_index: 3,
            block_number: 1,
        };
        assert!(storage.record_transfer(mint.clone()).await.unwrap());
        assert!(!storage.record_transfer(mint).await.unwrap());
        assert_eq!(storage.total_supply("ethereum", CONTRACT).await, 1);
        assert_eq!(storage.owner_of("ethereum", CONTRACT, "9").await.as_deref(), Some(BOB));
    }

    #[tokio::test]
    async fn test_zero_holding_is_removed() {
        let storage = MemStorage::new();
        let holding = |balance: &str| HoldingRecord {
            user_id: "user-1".into(),
            wallet_address: ALICE.into(),
            chain_id: "polygon".into(),
            contract_address: CONTRACT.into(),
            token_id: "4".into(),
            balance: balance.into(),
            block_number: 3,
        };
        storage.store_holding(holding("2")).await.unwrap();
        assert_eq!(storage.holdings_for_user("user-1").await.len(), 1);
        storage.store_holding(holding("0")).await.unwrap();
        assert!(storage.holdings_for_user("user-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_offline_store_rejects_calls() {
        let storage = MemStorage::new();
        storage.set_available(false);
        assert!(storage.store_transaction(record("0xt1", 0, 1, ALICE, BOB)).await.is_err());
        assert!(storage.get_pending_transactions(5, 3).await.is_err());
        storage.set_available(true);
        assert!(storage.store_transaction(record("0xt1", 0, 1, ALICE, BOB)).await.is_ok());
    }
}

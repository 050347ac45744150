//! Domain update payloads carried on the library and store channels.

use serde::{Deserialize, Serialize};

use crate::{
    ActivityType, BalanceEvent, EventType, ListingEvent, ProcessingState, PurchaseEvent,
    TokenEvent, TransactionRecord,
};

/// The two logical pub/sub channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateChannel {
    Library,
    Store,
}

impl UpdateChannel {
    pub fn topic(&self) -> &'static str {
        match self {
            UpdateChannel::Library => "library:update",
            UpdateChannel::Store => "store:update",
        }
    }

    /// Namespace of parked updates from this channel
    pub fn failed_namespace(&self) -> &'static str {
        match self {
            UpdateChannel::Library => "library:failed",
            UpdateChannel::Store => "store:failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LibraryChange {
    Activity {
        activity_type: ActivityType,
        transaction_hash: String,
        counterparty: Option<String>,
    },
    Balance {
        balance: String,
    },
}

/// Change to the holdings of one registered user's wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryUpdate {
    pub user_id: String,
    pub wallet_address: String,
    pub chain_id: String,
    pub contract_address: String,
    pub token_id: String,
    pub block_number: u64,
    pub timestamp: u64,
    pub change: LibraryChange,
}

impl LibraryUpdate {
    pub fn for_recipient(user_id: &str, event: &TokenEvent) -> Self {
        let activity_type = if event.is_mint() {
            ActivityType::Mint
        } else {
            ActivityType::Receive
        };
        Self {
            user_id: user_id.to_string(),
            wallet_address: event.to.clone(),
            chain_id: event.chain_id.clone(),
            contract_address: event.contract_address.clone(),
            token_id: event.token_id.clone(),
            block_number: event.block_number,
            timestamp: event.timestamp,
            change: LibraryChange::Activity {
                activity_type,
                transaction_hash: event.transaction_hash.clone(),
                counterparty: Some(event.from.clone()),
            },
        }
    }

    pub fn for_balance(user_id: &str, event: &BalanceEvent) -> Self {
        Self {
            user_id: user_id.to_string(),
            wallet_address: event.wallet_address.clone(),
            chain_id: event.chain_id.clone(),
            contract_address: event.contract_address.clone(),
            token_id: event.token_id.clone(),
            block_number: event.block_number,
            timestamp: event.timestamp,
            change: LibraryChange::Balance {
                balance: event.balance.clone(),
            },
        }
    }
}

/// Marketplace flag of a store update. A listing is the `Listing` variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreActivity {
    Transfer,
    Listing { price: String, quantity: String },
    Purchase { quantity: String },
}

/// Change to the global token state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreUpdate {
    pub chain_id: String,
    pub contract_address: String,
    pub token_id: String,
    /// Sender, seller for listings and purchases
    pub from: String,
    /// Recipient, buyer for purchases, empty for listings
    pub to: String,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub timestamp: u64,
    pub activity: StoreActivity,
}

impl StoreUpdate {
    pub fn event_type(&self) -> EventType {
        match self.activity {
            StoreActivity::Transfer => EventType::Transfer,
            StoreActivity::Listing { .. } => EventType::Listing,
            StoreActivity::Purchase { .. } => EventType::Purchase,
        }
    }

    pub fn to_record(&self) -> TransactionRecord {
        let (price, quantity) = match &self.activity {
            StoreActivity::Transfer => (None, None),
            StoreActivity::Listing { price, quantity } => {
                (Some(price.clone()), Some(quantity.clone()))
            }
            StoreActivity::Purchase { quantity } => (None, Some(quantity.clone())),
        };
        TransactionRecord {
            chain_id: self.chain_id.clone(),
            transaction_hash: self.transaction_hash.clone(),
            log_index: self.log_index,
            block_number: self.block_number,
            timestamp: self.timestamp,
            event_type: self.event_type(),
            contract_address: self.contract_address.clone(),
            token_id: self.token_id.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            price,
            quantity,
            processing_status: ProcessingState::New,
            processing_attempts: 0,
        }
    }

    /// Rebuild the update a stored transaction record was created from
    pub fn from_record(record: &TransactionRecord) -> Self {
        let quantity = record.quantity.clone().unwrap_or_else(|| "1".to_string());
        let activity = match record.event_type {
            EventType::Transfer => StoreActivity::Transfer,
            EventType::Listing => StoreActivity::Listing {
                price: record.price.clone().unwrap_or_else(|| "0".to_string()),
                quantity,
            },
            EventType::Purchase => StoreActivity::Purchase { quantity },
        };
        Self {
            chain_id: record.chain_id.clone(),
            contract_address: record.contract_address.clone(),
            token_id: record.token_id.clone(),
            from: record.from.clone(),
            to: record.to.clone(),
            transaction_hash: record.transaction_hash.clone(),
            log_index: record.log_index,
            block_number: record.block_number,
            timestamp: record.timestamp,
            activity,
        }
    }
}

impl From<&TokenEvent> for StoreUpdate {
    fn from(event: &TokenEvent) -> Self {
        Self {
            chain_id: event.chain_id.clone(),
            contract_address: event.contract_address.clone(),
            token_id: event.token_id.clone(),
            from: event.from.clone(),
            to: event.to.clone(),
            transaction_hash: event.transaction_hash.clone(),
            log_index: event.log_index,
            block_number: event.block_number,
            timestamp: event.timestamp,
            activity: StoreActivity::Transfer,
        }
    }
}

impl From<&ListingEvent> for StoreUpdate {
    fn from(event: &ListingEvent) -> Self {
        Self {
            chain_id: event.chain_id.clone(),
            contract_address: event.contract_address.clone(),
            token_id: event.token_id.clone(),
            from: event.seller.clone(),
            to: String::new(),
            transaction_hash: event.transaction_hash.clone(),
            log_index: event.log_index,
            block_number: event.block_number,
            timestamp: event.timestamp,
            activity: StoreActivity::Listing {
                price: event.price.clone(),
                quantity: event.quantity.clone(),
            },
        }
    }
}

impl From<&PurchaseEvent> for StoreUpdate {
    fn from(event: &PurchaseEvent) -> Self {
        Self {
            chain_id: event.chain_id.clone(),
            contract_address: event.contract_address.clone(),
            token_id: event.token_id.clone(),
            from: event.seller.clone(),
            to: event.buyer.clone(),
            transaction_hash: event.transaction_hash.clone(),
            log_index: event.log_index,
            block_number: event.block_number,
            timestamp: event.timestamp,
            activity: StoreActivity::Purchase {
                quantity: event.quantity.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "update", rename_all = "lowercase")]
pub enum ParkedUpdate {
    Library(LibraryUpdate),
    Store(StoreUpdate),
    /// Library side of a transfer whose recipient could not be looked up
    Recipient(TokenEvent),
    /// Balance observation whose wallet could not be looked up
    Balance(BalanceEvent),
}

impl ParkedUpdate {
    pub fn channel(&self) -> UpdateChannel {
        match self {
            ParkedUpdate::Store(_) => UpdateChannel::Store,
            ParkedUpdate::Library(_) | ParkedUpdate::Recipient(_) | ParkedUpdate::Balance(_) => {
                UpdateChannel::Library
            }
        }
    }
}

/// An update whose persistence exhausted its retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUpdate {
    pub id: String,
    pub update: ParkedUpdate,
    pub error: String,
    /// Seconds since the unix epoch
    pub failed_at: u64,
    /// Recovery passes that have already failed for this update
    pub recovery_attempts: u32,
}

//! Global token ownership ledger

use std::collections::{BTreeMap, HashMap, HashSet};

use chaincrawl_core::{normalize_address, OwnershipTransfer, ZERO_ADDRESS};

/// `(chain, contract)`
type CollectionKey = (String, String);

#[derive(Debug, Default, Clone)]
struct Collection {
    owners: HashMap<String, String>,
    balances: BTreeMap<String, u64>,
    total_supply: u64,
}

/// Ownership of every token seen in a transfer.
///
/// A transfer from the zero address mints, one to the zero address burns.
/// Holders whose balance reaches zero are removed. Each transfer is applied
/// at most once per `(chain, transaction hash, log index)`.
#[derive(Debug, Default, Clone)]
pub struct TokenLedger {
    collections: HashMap<CollectionKey, Collection>,
    applied: HashSet<(String, String, u64)>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the transfer was already applied
    pub fn apply(&mut self, transfer: &OwnershipTransfer) -> bool {
        if !self.applied.insert(transfer.key()) {
            return false;
        }
        let from = normalize_address(&transfer.from);
        let to = normalize_address(&transfer.to);
        let collection = self
            .collections
            .entry((
                transfer.chain_id.clone(),
                normalize_address(&transfer.contract_address),
            ))
            .or_default();

        if from == ZERO_ADDRESS {
            collection.total_supply += 1;
        } else if let Some(balance) = collection.balances.get_mut(&from) {
            *balance = balance.saturating_sub(1);
            if *balance == 0 {
                collection.balances.remove(&from);
            }
        }

        if to == ZERO_ADDRESS {
            collection.total_supply = collection.total_supply.saturating_sub(1);
            collection.owners.remove(&transfer.token_id);
        } else {
            *collection.balances.entry(to.clone()).or_insert(0) += 1;
            collection.owners.insert(transfer.token_id.clone(), to);
        }
        true
    }

    pub fn owner_of(&self, chain_id: &str, contract: &str, token_id: &str) -> Option<&str> {
        self.collection(chain_id, contract)?
            .owners
            .get(token_id)
            .map(String::as_str)
    }

    pub fn balance_of(&self, chain_id: &str, contract: &str, holder: &str) -> u64 {
        self.collection(chain_id, contract)
            .and_then(|c| c.balances.get(&normalize_address(holder)).copied())
            .unwrap_or(0)
    }

    pub fn total_supply(&self, chain_id: &str, contract: &str) -> u64 {
        self.collection(chain_id, contract)
            .map(|c| c.total_supply)
            .unwrap_or(0)
    }

    /// Holders with a positive balance, in address order
    pub fn holders(&self, chain_id: &str, contract: &str) -> Vec<(String, u64)> {
        self.collection(chain_id, contract)
            .map(|c| c.balances.iter().map(|(h, b)| (h.clone(), *b)).collect())
            .unwrap_or_default()
    }

    fn collection(&self, chain_id: &str, contract: &str) -> Option<&Collection> {
        self.collections
            .get(&(chain_id.to_string(), normalize_address(contract)))
    }
}

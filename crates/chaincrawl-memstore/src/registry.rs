use async_trait::async_trait;
use log::info;
use std::collections::HashMap;
use tokio::sync::RwLock;

use chaincrawl_core::{
    normalize_address, CrawlError, CrawlResult, WalletRegistration, WalletRegistry,
};

/// Wallet registry keyed by normalized address.
///
/// Deregistration only deactivates; the record is kept so the wallet can be
/// re-registered by the same or another user later.
#[derive(Default)]
pub struct MemWalletRegistry {
    wallets: RwLock<HashMap<String, WalletRegistration>>,
}

impl MemWalletRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletRegistry for MemWalletRegistry {
    async fn get_user_id_for_wallet(&self, address: &str) -> CrawlResult<Option<String>> {
        Ok(self
            .wallets
            .read()
            .await
            .get(&normalize_address(address))
            .filter(|w| w.active)
            .map(|w| w.user_id.clone()))
    }

    async fn register_wallet(&self, address: &str, user_id: &str) -> CrawlResult<()> {
        let address = normalize_address(address);
        let mut wallets = self.wallets.write().await;
        if let Some(existing) = wallets.get(&address) {
            if existing.active && existing.user_id != user_id {
                return Err(CrawlError::WalletConflict { address });
            }
        }
        info!("Registered wallet {} for user {}", address, user_id);
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
        let mut wallets = self.wallets.write().await;
        match wallets.get_mut(&normalize_address(address)) {
            Some(wallet) if wallet.active => {
                wallet.active = false;
                info!("Deregistered wallet {}", wallet.address);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_all_active_wallets(&self) -> CrawlResult<Vec<WalletRegistration>> {
        let mut active: Vec<_> = self
            .wallets
            .read()
            .await
            .values()
            .filter(|w| w.active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(active)
    }

    async fn get_wallets_for_user(&self, user_id: &str) -> CrawlResult<Vec<String>> {
        let mut addresses: Vec<_> = self
            .wallets
            .read()
            .await
            .values()
            .filter(|w| w.active && w.user_id == user_id)
            .map(|w| w.address.clone())
            .collect();
        addresses.sort();
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET: &str = "0xAbCdEf0000000000000000000000000000000001";

    #[tokio::test]
    async fn test_lookup_is_case_insensitive() {
        let registry = MemWalletRegistry::new();
        registry.register_wallet(WALLET, "user-1").await.unwrap();
        assert_eq!(
            registry
                .get_user_id_for_wallet(&WALLET.to_uppercase().replace("0X", "0x"))
                .await
                .unwrap(),
            Some("user-1".to_string())
        );
        assert_eq!(
            registry.get_wallets_for_user("user-1").await.unwrap(),
            vec![WALLET.to_lowercase()]
        );
    }

    #[tokio::test]
    async fn test_conflicting_registration_is_rejected() {
        let registry = MemWalletRegistry::new();
        registry.register_wallet(WALLET, "user-1").await.unwrap();
        registry.register_wallet(WALLET, "user-1").await.unwrap();
        assert!(matches!(
            registry.register_wallet(WALLET, "user-2").await,
            Err(CrawlError::WalletConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_deregistered_wallet_can_move_to_another_user() {
        let registry = MemWalletRegistry::new();
        registry.register_wallet(WALLET, "user-1").await.unwrap();
        assert!(registry.deregister_wallet(WALLET).await.unwrap());
        assert!(!registry.deregister_wallet(WALLET).await.unwrap());
        assert_eq!(registry.get_user_id_for_wallet(WALLET).await.unwrap(), None);
        assert!(registry.get_all_active_wallets().await.unwrap().is_empty());

        registry.register_wallet(WALLET, "user-2").await.unwrap();
        let active = registry.get_all_active_wallets().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, "user-2");
    }
}

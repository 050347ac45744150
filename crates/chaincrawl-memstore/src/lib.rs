//! In-memory collaborators for the crawler engine.
//!
//! - [`MemStorage`]: transactions, wallet activity, holdings and the token ledger
//! - [`MemWalletRegistry`]: wallet-to-user registrations
//! - [`MemFailedStore`]: parked and dead updates
//! - [`MemPubSub`]: the library and store update channels

pub mod failed;
pub mod ledger;
pub mod pubsub;
pub mod registry;
pub mod storage;

pub use failed::{failed_key, MemFailedStore};
pub use ledger::TokenLedger;
pub use pubsub::{MemPubSub, DEFAULT_CHANNEL_CAPACITY};
pub use registry::MemWalletRegistry;
pub use storage::MemStorage;

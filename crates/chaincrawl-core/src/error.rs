//! Error types for chaincrawl-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Chain RPC error on {chain}: {message}")]
    ChainRpc { chain: String, message: String },

    #[error("Block {block} not found on {chain}")]
    BlockNotFound { chain: String, block: u64 },

    #[error("Log decode error: {0}")]
    Decode(String),

    #[error("Chain reorganization on {chain} detected at block {block}")]
    Reorg { chain: String, block: u64 },

    #[error("Reorg on {chain} at block {block} is deeper than the tolerated {depth} blocks")]
    ReorgDepthExceeded { chain: String, block: u64, depth: u64 },

    #[error("Unsupported chain: {0}")]
    UnsupportedChain(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Wallet registry error: {0}")]
    Registry(String),

    #[error("Wallet {address} is already registered to another user")]
    WalletConflict { address: String },

    #[error("Pub/sub error: {0}")]
    PubSub(String),

    #[error("Worker {0} unavailable")]
    WorkerUnavailable(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl CrawlError {
    pub fn rpc(chain: impl Into<String>, message: impl std::fmt::Display) -> Self {
        CrawlError::ChainRpc {
            chain: chain.into(),
            message: message.to_string(),
        }
    }

    /// Whether the failure is transient and the unit of work should be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CrawlError::ChainRpc { .. }
                | CrawlError::BlockNotFound { .. }
                | CrawlError::Storage(_)
                | CrawlError::Queue(_)
                | CrawlError::Registry(_)
                | CrawlError::PubSub(_)
                | CrawlError::WorkerUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for CrawlError {
    fn from(e: serde_json::Error) -> Self {
        CrawlError::Serialization(e.to_string())
    }
}

pub type CrawlResult<T> = Result<T, CrawlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CrawlError::rpc("ethereum", "timeout").is_retryable());
        assert!(CrawlError::Storage("down".into()).is_retryable());
        assert!(!CrawlError::Decode("bad topic".into()).is_retryable());
        assert!(!CrawlError::ReorgDepthExceeded {
            chain: "bsc".into(),
            block: 10,
            depth: 64
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display_includes_chain() {
        let err = CrawlError::BlockNotFound {
            chain: "polygon".into(),
            block: 42,
        };
        assert_eq!(err.to_string(), "Block 42 not found on polygon");
    }
}

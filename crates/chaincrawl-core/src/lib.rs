//! # Multi-Chain Token Crawler Engine
//!
//! Crawls EVM-compatible chains block by block, decodes token transfer and
//! marketplace events, and turns them into per-user library updates and
//! global store updates.
//!
//! ## Core Architecture
//!
//! ### Chain Access
//! - **[`ChainAdapter`]**: uniform RPC access to one chain, with event decoders
//! - **[`ChainAdapterFactory`]**: lazily built, cached adapter per configured chain
//! - **[`EvmChainAdapter`]**: JSON-RPC implementation for Ethereum, Polygon and BSC
//!
//! ### Crawl Pipeline
//! - **[`JobCoordinator`]**: picks chains by priority, sizes batches to the
//!   observed processing rate, tracks per-chain progress and detects reorgs
//! - **[`WorkerManager`]**: pool of [`BlockWorker`]s, each with its own job queue
//! - **[`EventProcessor`]**: persists updates with retry and parks what cannot be
//!   persisted for later recovery
//!
//! ### Collaborators
//! Storage, the wallet registry, the dead-letter store and the pub/sub bus are
//! traits in [`traits`]. The `chaincrawl-memstore` crate has in-memory versions
//! and `chaincrawl-mono` wires everything into a service.
//!
//! ## Testing
//! Enable the `test-utils` feature for the scriptable doubles in [`mock`].

pub mod adapter;
pub mod coordinator;
pub mod decode;
pub mod error;
pub mod factory;
pub mod metadata;
pub mod processor;
pub mod retry;
pub mod traits;
pub mod types;
pub mod update;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use error::*;
pub use traits::*;
pub use types::*;
pub use update::*;

pub use adapter::{ChainKind, EvmAdapterBuilder, EvmChainAdapter};
pub use coordinator::{
    ChainProgress, ChainStatusReport, CoordinatorCommand, CoordinatorEvent, CoordinatorHandle,
    CoordinatorStatus, JobCoordinator, WorkerHealthState, WorkerStatusReport,
};
pub use factory::ChainAdapterFactory;
pub use processor::{
    EventProcessor, ProcessingStatusSnapshot, ProcessorConfig, ProcessorNotification,
    RecoveryReport, TransferOutcome, UpdateOutcome,
};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use worker::{BlockStats, BlockWorker, WorkerEvent, WorkerManager, WorkerSettings};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::*;

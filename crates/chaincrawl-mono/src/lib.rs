//! # Chaincrawl-Mono: Multi-Chain Token Crawler Service
//!
//! ## OVERVIEW
//!
//! `chaincrawl-mono` runs the whole crawler in one process: the per-chain
//! adapters, the job coordinator, the block worker pool and the event
//! processor, plus a JSON-RPC control server.
//!
//! ## ARCHITECTURE
//!
//! - **Chains**: one [`EvmChainAdapter`](chaincrawl_core::EvmChainAdapter) per chain whose RPC URL is configured
//! - **Scheduling**: [`JobCoordinator`] ticks over the chains and dispatches block batches
//! - **Execution**: [`WorkerManager`] runs the block workers
//! - **Updates**: [`EventProcessor`] persists library and store updates, parking failures
//!   in the dead-letter store (RocksDB when `--dead-letter-path` is set)
//!
//! ## USAGE
//!
//! Every option can be given on the command line or through the environment; see [`Args`].
//! A chain is crawled only when its RPC URL is set.

pub mod dead_letter;

#[cfg(test)]
mod tests;

use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer, Responder, Result as ActixResult};
use anyhow::{anyhow, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::task::{JoinError, JoinHandle};

use chaincrawl_core::{
    ActivityFilter, AdapterBuilder, ChainAdapterFactory, ChainConfig, ChainKind,
    CoordinatorHandle, CrawlError, CrawlResult, CrawlerConfig, EvmAdapterBuilder, EventProcessor,
    FailedUpdateStore, JobCoordinator, JobDispatcher, ProcessorConfig, PubSub, Storage,
    TransactionFilter, WalletRegistry, WorkerManager, WorkerSettings,
};
use chaincrawl_memstore::{MemFailedStore, MemPubSub, MemStorage, MemWalletRegistry};

use crate::dead_letter::RocksDbFailedStore;

/// Command-line arguments for `chaincrawl-mono`.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[arg(long, env = "ETH_RPC_URL")]
    pub eth_rpc_url: Option<String>,
    #[arg(long, env = "ETH_START_BLOCK", default_value_t = 0)]
    pub eth_start_block: u64,
    #[arg(long, env = "ETH_CONFIRMATIONS")]
    pub eth_confirmations: Option<u64>,
    #[arg(long, env = "POLYGON_RPC_URL")]
    pub polygon_rpc_url: Option<String>,
    #[arg(long, env = "POLYGON_START_BLOCK", default_value_t = 0)]
    pub polygon_start_block: u64,
    #[arg(long, env = "POLYGON_CONFIRMATIONS")]
    pub polygon_confirmations: Option<u64>,
    #[arg(long, env = "BSC_RPC_URL")]
    pub bsc_rpc_url: Option<String>,
    #[arg(long, env = "BSC_START_BLOCK", default_value_t = 0)]
    pub bsc_start_block: u64,
    #[arg(long, env = "BSC_CONFIRMATIONS")]
    pub bsc_confirmations: Option<u64>,
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 3)]
    pub worker_concurrency: usize,
    #[arg(long, env = "WORKER_RETRY_LIMIT", default_value_t = 5)]
    pub worker_retry_limit: u32,
    /// Milliseconds before a running block job counts as stalled
    #[arg(long, env = "WORKER_STALLED_TIMEOUT", default_value_t = 30_000)]
    pub worker_stalled_timeout: u64,
    /// Milliseconds; also the coordination tick
    #[arg(long, env = "WORKER_BACKOFF_DELAY", default_value_t = 1_000)]
    pub worker_backoff_delay: u64,
    /// Milliseconds between worker health checks
    #[arg(long, env = "HEALTH_CHECK_INTERVAL", default_value_t = 30_000)]
    pub health_check_interval: u64,
    #[arg(long, env = "TARGET_PROCESSING_RATE", default_value_t = 10.0)]
    pub target_processing_rate: f64,
    #[arg(long, env = "REORG_THRESHOLD", default_value_t = 64)]
    pub reorg_threshold: u64,
    #[arg(long, env = "PROCESSOR_RETRY_LIMIT", default_value_t = 3)]
    pub processor_retry_limit: u32,
    /// Milliseconds before the first persistence retry
    #[arg(long, env = "PROCESSOR_RETRY_DELAY", default_value_t = 5_000)]
    pub processor_retry_delay: u64,
    #[arg(long, env = "MAX_RECOVERY_ATTEMPTS", default_value_t = 10)]
    pub max_recovery_attempts: u32,
    /// Seconds between recovery passes over parked updates
    #[arg(long, env = "RECOVERY_INTERVAL", default_value_t = 60)]
    pub recovery_interval: u64,
    #[arg(long, env = "DEAD_LETTER_PATH")]
    pub dead_letter_path: Option<PathBuf>,
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
    #[arg(long)]
    pub cors: Option<String>,
}

/// Chains whose RPC URL is set, with the chain's confirmation default where none is given
pub fn chain_configs_from_args(args: &Args) -> Vec<ChainConfig> {
    let chains = [
        (ChainKind::Ethereum, &args.eth_rpc_url, args.eth_start_block, args.eth_confirmations),
        (
            ChainKind::Polygon,
            &args.polygon_rpc_url,
            args.polygon_start_block,
            args.polygon_confirmations,
        ),
        (ChainKind::Bsc, &args.bsc_rpc_url, args.bsc_start_block, args.bsc_confirmations),
    ];
    chains
        .into_iter()
        .filter_map(|(kind, url, start_block, confirmations)| {
            let url = url.as_ref().filter(|u| !u.trim().is_empty())?;
            Some(
                ChainConfig::new(kind.name(), url.clone())
                    .with_start_block(start_block)
                    .with_confirmations(confirmations.unwrap_or(kind.default_confirmations())),
            )
        })
        .collect()
}

pub fn crawler_config_from_args(args: &Args) -> CrawlResult<CrawlerConfig> {
    let backoff = Duration::from_millis(args.worker_backoff_delay);
    let config = CrawlerConfig {
        retry_limit: args.worker_retry_limit,
        stalled_timeout: Duration::from_millis(args.worker_stalled_timeout),
        backoff_delay: backoff,
        coordination_interval: backoff,
        health_check_interval: Duration::from_millis(args.health_check_interval),
        target_processing_rate: args.target_processing_rate,
        reorg_threshold: args.reorg_threshold,
        ..CrawlerConfig::with_concurrency(args.worker_concurrency)
    };
    config.validate()?;
    Ok(config)
}

pub fn processor_config_from_args(args: &Args) -> ProcessorConfig {
    ProcessorConfig {
        retry_limit: args.processor_retry_limit,
        retry_delay: Duration::from_millis(args.processor_retry_delay),
        max_recovery_attempts: args.max_recovery_attempts,
        ..ProcessorConfig::default()
    }
}

/// Persistence and messaging backends the pipeline runs against
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub registry: Arc<dyn WalletRegistry>,
    pub failed: Arc<dyn FailedUpdateStore>,
    pub pubsub: Arc<dyn PubSub>,
}

impl Collaborators {
    pub fn in_memory() -> Self {
        Self {
            storage: Arc::new(MemStorage::new()),
            registry: Arc::new(MemWalletRegistry::new()),
            failed: Arc::new(MemFailedStore::new()),
            pubsub: Arc::new(MemPubSub::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub crawler: CrawlerConfig,
    pub processor: ProcessorConfig,
    pub recovery_interval: Duration,
}

impl PipelineConfig {
    pub fn from_args(args: &Args) -> CrawlResult<Self> {
        Ok(Self {
            crawler: crawler_config_from_args(args)?,
            processor: processor_config_from_args(args),
            recovery_interval: Duration::from_secs(args.recovery_interval.max(1)),
        })
    }
}

/// A running crawler: coordinator, workers, processor and its background tasks
pub struct Pipeline {
    pub coordinator: CoordinatorHandle,
    pub processor: Arc<EventProcessor>,
    pub factory: Arc<ChainAdapterFactory>,
    workers: Arc<WorkerManager>,
    coordinator_task: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub async fn start(
        config: PipelineConfig,
        chains: Vec<ChainConfig>,
        builder: Arc<dyn AdapterBuilder>,
        collaborators: &Collaborators,
    ) -> CrawlResult<Self> {
        if chains.is_empty() {
            return Err(CrawlError::Config(
                "no chain has an RPC URL configured".to_string(),
            ));
        }
        config.crawler.validate()?;

        let factory = Arc::new(ChainAdapterFactory::new(chains, builder));
        let ready = factory.initialize_all_adapters().await;
        info!(
            "{} of {} chain adapters ready",
            ready,
            factory.chain_ids().len()
        );

        let processor = Arc::new(EventProcessor::new(
            config.processor.clone(),
            collaborators.storage.clone(),
            collaborators.registry.clone(),
            collaborators.failed.clone(),
        ));
        let mut background = processor
            .run_subscriptions(collaborators.pubsub.as_ref())
            .await?;
        background.push(tokio::spawn(
            processor.clone().run_recovery(config.recovery_interval),
        ));

        let (workers, worker_events) = WorkerManager::start(
            config.crawler.concurrency,
            WorkerSettings::from(&config.crawler),
            factory.clone(),
            processor.clone(),
        );
        let workers = Arc::new(workers);
        let dispatcher: Arc<dyn JobDispatcher> = workers.clone();
        let coordinator = JobCoordinator::new(config.crawler, factory.clone(), dispatcher)?;
        let (handle, coordinator_task) = coordinator.spawn(worker_events);

        Ok(Self {
            coordinator: handle,
            processor,
            factory,
            workers,
            coordinator_task,
            background,
        })
    }

    /// Resolves when the coordinator loop exits on its own
    pub async fn stopped(&mut self) -> Result<(), JoinError> {
        (&mut self.coordinator_task).await
    }

    /// Stop scheduling, drain in-flight blocks and stop background tasks.
    pub async fn shutdown(mut self) {
        self.coordinator.shutdown().await;
        if !self.coordinator_task.is_finished() {
            if let Err(e) = (&mut self.coordinator_task).await {
                error!("Coordinator task failed: {}", e);
            }
        }
        self.workers.shutdown().await;
        for task in self.background.drain(..) {
            task.abort();
        }
        self.factory.clear_all_adapters().await;
        info!("Pipeline stopped");
    }
}

/// Shared application state for the JSON-RPC server.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: CoordinatorHandle,
    pub processor: Arc<EventProcessor>,
    pub registry: Arc<dyn WalletRegistry>,
    pub storage: Arc<dyn Storage>,
    pub failed: Arc<dyn FailedUpdateStore>,
}

impl AppState {
    pub fn new(pipeline: &Pipeline, collaborators: &Collaborators) -> Self {
        Self {
            coordinator: pipeline.coordinator.clone(),
            processor: pipeline.processor.clone(),
            registry: collaborators.registry.clone(),
            storage: collaborators.storage.clone(),
            failed: collaborators.failed.clone(),
        }
    }
}

fn param_str<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a str> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing parameter {} ({})", index, name))
}

fn param_limit(params: &[Value], index: usize) -> Option<usize> {
    params.get(index).and_then(Value::as_u64).map(|l| l as usize)
}

/// Execute one JSON-RPC method against the running crawler
pub async fn dispatch_rpc(state: &AppState, method: &str, params: &[Value]) -> Result<Value> {
    match method {
        "crawler_status" => Ok(json!({
            "coordinator": state.coordinator.status(),
            "processor": state.processor.status(),
            "parkedUpdates": state.failed.list_failed().await?.len(),
            "deadUpdates": state.failed.list_dead().await?.len(),
        })),
        "crawler_registerWallet" => {
            let address = param_str(params, 0, "address")?;
            let user_id = param_str(params, 1, "userId")?;
            state.registry.register_wallet(address, user_id).await?;
            Ok(json!(true))
        }
        "crawler_deregisterWallet" => {
            let address = param_str(params, 0, "address")?;
            Ok(json!(state.registry.deregister_wallet(address).await?))
        }
        "crawler_activeWallets" => Ok(serde_json::to_value(
            state.registry.get_all_active_wallets().await?,
        )?),
        "crawler_resync" => {
            let chain_id = param_str(params, 0, "chainId")?;
            let from_block = params.get(1).and_then(Value::as_u64);
            state.coordinator.resync(chain_id, from_block).await?;
            Ok(json!(true))
        }
        "crawler_processFailed" => Ok(serde_json::to_value(
            state.processor.process_failed_updates().await?,
        )?),
        "crawler_walletTransactions" => {
            let address = param_str(params, 0, "address")?;
            let filter = TransactionFilter {
                limit: param_limit(params, 1),
                ..TransactionFilter::default()
            };
            Ok(serde_json::to_value(
                state.storage.get_wallet_transactions(address, &filter).await?,
            )?)
        }
        "crawler_walletActivity" => {
            let address = param_str(params, 0, "address")?;
            let filter = ActivityFilter {
                limit: param_limit(params, 1),
                ..ActivityFilter::default()
            };
            Ok(serde_json::to_value(
                state.storage.get_wallet_activity_history(address, &filter).await?,
            )?)
        }
        _ => Err(anyhow!("Method not found")),
    }
}

/// Handles JSON-RPC requests.
pub async fn handle_jsonrpc(
    body: web::Json<Value>,
    state: web::Data<AppState>,
) -> ActixResult<impl Responder> {
    let request: Value = body.into_inner();
    let method = request["method"].as_str().unwrap_or_default();
    let empty_params = vec![];
    let params = request["params"].as_array().unwrap_or(&empty_params);
    let id = request["id"].clone();

    let start_time = Instant::now();
    let result = dispatch_rpc(&state, method, params).await;
    let duration = start_time.elapsed();

    if duration > Duration::from_millis(100) {
        warn!("Slow RPC call: {} took {:?}", method, duration);
    } else {
        debug!("RPC call: {} completed in {:?}", method, duration);
    }

    let response = match result {
        Ok(res) => json!({
            "jsonrpc": "2.0",
            "result": res,
            "id": id
        }),
        Err(e) => {
            error!("RPC error for method {}: {}", method, e);
            json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": -32000,
                    "message": e.to_string()
                },
                "id": id
            })
        }
    };

    Ok(HttpResponse::Ok().json(response))
}

fn cors_from(setting: &Option<String>) -> Cors {
    match setting {
        Some(value) if value == "*" => Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header(),
        Some(value) => {
            let mut cors = Cors::default();
            for origin in value.split(',') {
                cors = cors.allowed_origin(origin.trim());
            }
            cors
        }
        None => Cors::default().allowed_origin("http://localhost:8080"),
    }
}

/// Sets up a signal handler for graceful shutdown.
async fn setup_signal_handler() -> Arc<AtomicBool> {
    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown_requested.clone();
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install CTRL+C signal handler: {}", e);
            return;
        }
        shutdown_clone.store(true, Ordering::SeqCst);
        info!("Shutdown signal received, initiating graceful shutdown...");
    });
    shutdown_requested
}

/// Main run function, generic over the chain transport and the collaborators.
pub async fn run(
    args: Args,
    builder: Arc<dyn AdapterBuilder>,
    collaborators: Collaborators,
) -> Result<()> {
    let chains = chain_configs_from_args(&args);
    for chain in &chains {
        info!(
            "[{}] crawling from block {} with {} confirmations",
            chain.chain_id, chain.start_block, chain.confirmations
        );
    }

    let mut pipeline =
        Pipeline::start(PipelineConfig::from_args(&args)?, chains, builder, &collaborators).await?;
    let app_state = web::Data::new(AppState::new(&pipeline, &collaborators));

    let cors_setting = args.cors.clone();
    let server = HttpServer::new(move || {
        App::new()
            .wrap(cors_from(&cors_setting))
            .app_data(app_state.clone())
            .service(web::resource("/").route(web::post().to(handle_jsonrpc)))
    })
    .bind((args.host.as_str(), args.port))?
    .run();
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    info!("JSON-RPC server running at http://{}:{}", args.host, args.port);

    let shutdown_signal = setup_signal_handler().await;
    tokio::select! {
        result = pipeline.stopped() => {
            if let Err(e) = result {
                error!("Coordinator task failed: {}", e);
            }
        }
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server failed: {}", e),
                Err(e) => error!("Server task failed: {}", e),
                Ok(Ok(())) => info!("Server stopped"),
            }
        }
        _ = async {
            loop {
                if shutdown_signal.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        } => {
            info!("Stopping JSON-RPC server");
        }
    }

    server_handle.stop(true).await;
    pipeline.shutdown().await;
    info!("Graceful shutdown complete.");
    Ok(())
}

/// Production-specific run function.
pub async fn run_prod(args: Args) -> Result<()> {
    let mut collaborators = Collaborators::in_memory();
    if let Some(path) = &args.dead_letter_path {
        collaborators.failed = Arc::new(RocksDbFailedStore::open(path)?);
    } else {
        warn!("No --dead-letter-path given, parked updates will not survive a restart");
    }
    let builder = Arc::new(EvmAdapterBuilder::new(reqwest::Client::new()));
    run(args, builder, collaborators).await
}

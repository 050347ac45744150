//! # Job Coordinator
//!
//! Single owner of all per-chain crawl progress. The coordinator runs two
//! fixed-interval loops and reacts to worker outcomes in between:
//!
//! - **Coordination tick**: rank chains by priority, refresh their target
//!   block, retry failed blocks first and otherwise dispatch the next
//!   adaptively sized batch, subject to the pending-block ceiling.
//! - **Health tick**: restart workers whose success rate collapsed or that sit
//!   on jobs without reporting, and return their blocks to the retry set.
//! - **Worker events**: every completed block is re-fetched and checked
//!   against the hash the worker saw and the recorded parent; a mismatch or a
//!   vanished block starts reorg recovery.
//!
//! ## Progress model
//!
//! Blocks complete out of order. `last_processed_block` is the contiguous
//! watermark over resolved blocks (verified, or dropped after exhausting
//! retries); `last_verified_block` is the highest verified block at or below
//! it. New batches start after the highest dispatched block so blocks already
//! in flight are never issued twice.
//!
//! Every reorg or resync bumps the chain's epoch. Jobs carry the epoch they
//! were issued under and outcomes from an older epoch are ignored.

use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::worker::WorkerEvent;
use crate::{
    unix_now, BlockJob, ChainAdapterFactory, CrawlError, CrawlResult, CrawlerConfig,
    JobDispatcher, QueueMetrics, SyncStatus, WorkerId,
};

/// A chain further behind its target than this is reported as syncing
pub const SYNCING_THRESHOLD: u64 = 1000;
/// Smoothing factor of the per-worker success rate
const SUCCESS_RATE_ALPHA: f64 = 0.1;
/// Delayed-job count above which a worker is reported in warning state
const DELAYED_WARNING_THRESHOLD: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBlock {
    pub worker_id: WorkerId,
    pub dispatched_at: Instant,
    pub epoch: u64,
}

/// Crawl state of one chain
#[derive(Debug, Clone)]
pub struct ChainProgress {
    pub last_processed_block: u64,
    pub last_verified_block: u64,
    pub target_block: u64,
    pub is_processing: bool,
    pub failed_blocks: BTreeSet<u64>,
    /// Failed attempts per block
    pub retry_count: HashMap<u64, u32>,
    pub pending_blocks: BTreeMap<u64, PendingBlock>,
    /// Blocks per second over the last tick
    pub processing_rate: f64,
    /// Failures per second over the last tick
    pub error_rate: f64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub dropped_blocks: u64,
    pub epoch: u64,
    /// Set when reorg recovery could not find a valid ancestor
    pub halted: Option<String>,
    pub adapter_error: Option<String>,
    dispatch_frontier: u64,
    resolved: BTreeMap<u64, bool>,
    block_hashes: BTreeMap<u64, String>,
    last_scheduled: Option<Instant>,
    last_rate_update: Instant,
    has_dispatched: bool,
}

impl ChainProgress {
    pub fn new(start_block: u64, seeded_rate: f64) -> Self {
        let last_processed = start_block.saturating_sub(1);
        Self {
            last_processed_block: last_processed,
            last_verified_block: last_processed,
            target_block: last_processed,
            is_processing: false,
            failed_blocks: BTreeSet::new(),
            retry_count: HashMap::new(),
            pending_blocks: BTreeMap::new(),
            processing_rate: seeded_rate,
            error_rate: 0.0,
            total_processed: 0,
            total_failed: 0,
            dropped_blocks: 0,
            epoch: 0,
            halted: None,
            adapter_error: None,
            dispatch_frontier: last_processed,
            resolved: BTreeMap::new(),
            block_hashes: BTreeMap::new(),
            last_scheduled: None,
            last_rate_update: Instant::now(),
            has_dispatched: false,
        }
    }

    pub fn blocks_behind(&self) -> u64 {
        self.target_block.saturating_sub(self.last_processed_block)
    }

    pub fn is_caught_up(&self) -> bool {
        self.last_processed_block >= self.target_block
    }

    /// Highest block handed to a worker so far
    pub fn dispatch_frontier(&self) -> u64 {
        self.dispatch_frontier
    }

    pub fn recorded_hash(&self, block: u64) -> Option<&str> {
        self.block_hashes.get(&block).map(String::as_str)
    }

    fn update_rates(&mut self, now: Instant) {
        if self.has_dispatched {
            let elapsed = now
                .duration_since(self.last_rate_update)
                .as_secs_f64()
                .max(0.001);
            self.processing_rate = self.total_processed as f64 / elapsed;
            self.error_rate = self.total_failed as f64 / elapsed;
        }
        self.total_processed = 0;
        self.total_failed = 0;
        self.last_rate_update = now;
    }

    fn is_resolved(&self, block: u64) -> bool {
        block <= self.last_processed_block || self.resolved.contains_key(&block)
    }

    /// Move the watermark over every contiguously resolved block
    fn advance_watermark(&mut self, reorg_threshold: u64) {
        while let Some(verified) = self.resolved.remove(&(self.last_processed_block + 1)) {
            self.last_processed_block += 1;
            if verified {
                self.last_verified_block = self.last_processed_block;
            }
        }
        self.dispatch_frontier = self.dispatch_frontier.max(self.last_processed_block);
        let keep_from = self
            .last_verified_block
            .saturating_sub(reorg_threshold.saturating_add(1));
        self.block_hashes = self.block_hashes.split_off(&keep_from);
    }

    fn mark_failed(&mut self, block: u64, count_attempt: bool) {
        self.pending_blocks.remove(&block);
        if self.is_resolved(block) {
            return;
        }
        self.failed_blocks.insert(block);
        if count_attempt {
            *self.retry_count.entry(block).or_insert(0) += 1;
            self.total_failed += 1;
        }
    }

    /// Forget everything above `block` and continue from there
    fn rewind_to(&mut self, block: u64) {
        self.last_processed_block = block;
        self.last_verified_block = self.last_verified_block.min(block);
        self.target_block = self.target_block.max(block);
        self.pending_blocks.clear();
        self.failed_blocks.clear();
        self.retry_count.retain(|b, _| *b <= block);
        self.resolved.clear();
        self.block_hashes.retain(|b, _| *b <= block);
        self.dispatch_frontier = block;
        self.is_processing = false;
        self.epoch += 1;
    }
}

/// Priority score: `0.4·blocksBehind + 0.3·rateDeficit + 0.2·(1 − errorRate) + 0.1·staleness`
pub fn chain_priority(progress: &ChainProgress, target_rate: f64, now: Instant) -> f64 {
    let behind = progress.blocks_behind() as f64;
    let rate_deficit = if target_rate > 0.0 {
        (1.0 - progress.processing_rate / target_rate).max(0.0)
    } else {
        0.0
    };
    let error_term = (1.0 - progress.error_rate).max(0.0);
    let staleness = match progress.last_scheduled {
        Some(at) => (now.duration_since(at).as_secs_f64() / 60.0).min(1.0),
        None => 1.0,
    };
    0.4 * behind + 0.3 * rate_deficit + 0.2 * error_term + 0.1 * staleness
}

/// Blocks to dispatch in one batch, always within `[min_blocks_per_batch, max_blocks_per_batch]`
pub fn adaptive_batch_size(
    config: &CrawlerConfig,
    processing_rate: f64,
    error_rate: f64,
    pending: usize,
) -> u64 {
    let mut size = (processing_rate * config.coordination_interval.as_secs_f64()).ceil();
    if error_rate > 0.1 {
        size *= 0.8;
    }
    let fill = pending as f64 / config.max_pending_blocks.max(1) as f64;
    if fill > 0.8 {
        size *= 0.5;
    }
    let size = if size.is_finite() { size.max(0.0) as u64 } else { 0 };
    size.clamp(config.min_blocks_per_batch, config.max_blocks_per_batch)
}

#[derive(Debug, Clone)]
struct WorkerHealth {
    success_rate: f64,
    active_jobs: usize,
    last_active: Instant,
}

impl WorkerHealth {
    fn new(now: Instant) -> Self {
        Self {
            success_rate: 1.0,
            active_jobs: 0,
            last_active: now,
        }
    }

    fn record(&mut self, success: bool, now: Instant) {
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate = (1.0 - SUCCESS_RATE_ALPHA) * self.success_rate + SUCCESS_RATE_ALPHA * sample;
        self.last_active = now;
    }
}

/// Observability events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    BlockDropped {
        chain_id: String,
        block_number: u64,
        attempts: u32,
    },
    ReorgDetected {
        chain_id: String,
        block_number: u64,
        rollback_to: u64,
    },
    ChainHalted {
        chain_id: String,
        block_number: u64,
        reason: String,
    },
    WorkerRestarted {
        worker_id: WorkerId,
        requeued: usize,
    },
    ChainResynced {
        chain_id: String,
        from_block: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerHealthState {
    Healthy,
    Warning,
    Error,
}

impl WorkerHealthState {
    pub fn classify(metrics: &QueueMetrics) -> Self {
        if metrics.failed as f64 > 0.1 * metrics.completed as f64 {
            WorkerHealthState::Error
        } else if metrics.delayed > DELAYED_WARNING_THRESHOLD {
            WorkerHealthState::Warning
        } else {
            WorkerHealthState::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainStatusReport {
    pub chain_id: String,
    pub processed_block: u64,
    pub target_block: u64,
    pub verified_block: u64,
    pub failed_count: usize,
    pub pending_count: usize,
    pub dropped_count: u64,
    pub processing_rate: f64,
    pub error_rate: f64,
    pub status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatusReport {
    pub worker_id: WorkerId,
    pub queue: QueueMetrics,
    pub success_rate: f64,
    pub active_jobs: usize,
    pub health: WorkerHealthState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinatorStatus {
    pub chains: Vec<ChainStatusReport>,
    pub workers: Vec<WorkerStatusReport>,
    pub updated_at: u64,
}

impl CoordinatorStatus {
    pub fn chain(&self, chain_id: &str) -> Option<&ChainStatusReport> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}

#[derive(Debug)]
pub enum CoordinatorCommand {
    Resync {
        chain_id: String,
        from_block: Option<u64>,
        reply: oneshot::Sender<CrawlResult<()>>,
    },
    Shutdown,
}

/// Cloneable control surface of a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<CoordinatorCommand>,
    status: watch::Receiver<CoordinatorStatus>,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl CoordinatorHandle {
    pub fn status(&self) -> CoordinatorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Restart crawling of a chain from `from_block`, or from its configured start block
    pub async fn resync(&self, chain_id: &str, from_block: Option<u64>) -> CrawlResult<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(CoordinatorCommand::Resync {
                chain_id: chain_id.to_string(),
                from_block,
                reply,
            })
            .await
            .map_err(|_| CrawlError::Queue("coordinator is not running".to_string()))?;
        response
            .await
            .map_err(|_| CrawlError::Queue("coordinator dropped the resync request".to_string()))?
    }

    pub async fn shutdown(&self) {
        if self.commands.send(CoordinatorCommand::Shutdown).await.is_err() {
            debug!("coordinator already stopped");
        }
    }
}

pub struct JobCoordinator {
    config: CrawlerConfig,
    factory: Arc<ChainAdapterFactory>,
    dispatcher: Arc<dyn JobDispatcher>,
    progress: BTreeMap<String, ChainProgress>,
    workers: BTreeMap<WorkerId, WorkerHealth>,
    events: broadcast::Sender<CoordinatorEvent>,
    status: watch::Sender<CoordinatorStatus>,
}

impl JobCoordinator {
    pub fn new(
        config: CrawlerConfig,
        factory: Arc<ChainAdapterFactory>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> CrawlResult<Self> {
        config.validate()?;
        let progress = factory
            .chain_configs()
            .map(|c| {
                (
                    c.chain_id.clone(),
                    ChainProgress::new(c.start_block, config.target_processing_rate),
                )
            })
            .collect();
        let (events, _) = broadcast::channel(256);
        let (status, _) = watch::channel(CoordinatorStatus::default());
        Ok(Self {
            config,
            factory,
            dispatcher,
            progress,
            workers: BTreeMap::new(),
            events,
            status,
        })
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub fn progress(&self, chain_id: &str) -> Option<&ChainProgress> {
        self.progress.get(chain_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub fn status_receiver(&self) -> watch::Receiver<CoordinatorStatus> {
        self.status.subscribe()
    }

    pub fn worker_success_rate(&self, worker_id: WorkerId) -> Option<f64> {
        self.workers.get(&worker_id).map(|h| h.success_rate)
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events.send(event);
    }

    /// One coordination step over the highest-priority chains
    pub async fn tick(&mut self) {
        let now = Instant::now();
        for progress in self.progress.values_mut() {
            progress.update_rates(now);
        }

        let active: Vec<String> = self
            .progress
            .iter()
            .filter(|(_, p)| p.halted.is_none())
            .map(|(chain_id, _)| chain_id.clone())
            .collect();
        let target_rate = self.config.target_processing_rate;
        let mut ranked = Vec::with_capacity(active.len());
        for chain_id in active {
            if !self.refresh_target(&chain_id).await {
                continue;
            }
            if let Some(progress) = self.progress.get(&chain_id) {
                let priority = chain_priority(progress, target_rate, now);
                ranked.push((chain_id, priority));
            }
        }
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(self.config.max_concurrent_chains);

        for (chain_id, priority) in ranked {
            self.schedule_chain(&chain_id, priority, now).await;
        }
        self.publish_status().await;
    }

    /// `target = head − confirmations`, never below the processed watermark
    async fn refresh_target(&mut self, chain_id: &str) -> bool {
        let confirmations = self
            .factory
            .chain_config(chain_id)
            .map(|c| c.confirmations)
            .unwrap_or(0);
        let latest = match self.factory.get_adapter(chain_id).await {
            Ok(adapter) => adapter.get_latest_block().await,
            Err(e) => Err(e),
        };
        let Some(progress) = self.progress.get_mut(chain_id) else {
            return false;
        };
        match latest {
            Ok(latest) => {
                progress.adapter_error = None;
                progress.target_block = latest
                    .saturating_sub(confirmations)
                    .max(progress.last_processed_block);
                true
            }
            Err(e) => {
                warn!("[{}] could not refresh chain head: {}", chain_id, e);
                progress.adapter_error = Some(e.to_string());
                false
            }
        }
    }

    async fn schedule_chain(&mut self, chain_id: &str, priority: f64, now: Instant) {
        let Some(progress) = self.progress.get_mut(chain_id) else {
            return;
        };
        progress.last_scheduled = Some(now);
        if progress.is_caught_up() {
            debug!(
                "[{}] caught up at block {}",
                chain_id, progress.last_processed_block
            );
            return;
        }

        let job_priority = (priority * 100.0).round().max(0.0) as u32;
        if !progress.failed_blocks.is_empty()
            && self.retry_failed_blocks(chain_id, job_priority).await > 0
        {
            return;
        }
        self.dispatch_batch(chain_id, job_priority).await;
    }

    /// Re-dispatch failed blocks, dropping those that used up their retries
    /// Returns how many blocks were handed back to workers.
    async fn retry_failed_blocks(&mut self, chain_id: &str, priority: u32) -> usize {
        let retry_limit = self.config.retry_limit;
        let max_pending = self.config.max_pending_blocks;
        let reorg_threshold = self.config.reorg_threshold;
        let failed: Vec<u64> = match self.progress.get(chain_id) {
            Some(progress) => progress.failed_blocks.iter().copied().collect(),
            None => return 0,
        };

        let mut retried = 0;
        for block in failed {
            let Some(progress) = self.progress.get_mut(chain_id) else {
                break;
            };
            let attempts = progress.retry_count.get(&block).copied().unwrap_or(0);
            if attempts >= retry_limit {
                progress.failed_blocks.remove(&block);
                progress.retry_count.remove(&block);
                progress.resolved.insert(block, false);
                progress.total_failed += 1;
                progress.dropped_blocks += 1;
                progress.advance_watermark(reorg_threshold);
                error!(
                    "[{}] block {} dropped after {} failed attempts",
                    chain_id, block, attempts
                );
                self.emit(CoordinatorEvent::BlockDropped {
                    chain_id: chain_id.to_string(),
                    block_number: block,
                    attempts,
                });
                continue;
            }
            if progress.pending_blocks.len() >= max_pending {
                debug!(
                    "[{}] pending ceiling reached, deferring remaining retries",
                    chain_id
                );
                retried += 1;
                break;
            }
            progress.failed_blocks.remove(&block);
            debug!(
                "[{}] retrying block {} (attempt {})",
                chain_id,
                block,
                attempts + 1
            );
            self.dispatch_block(chain_id, block, attempts, priority).await;
            retried += 1;
        }
        retried
    }

    async fn dispatch_batch(&mut self, chain_id: &str, priority: u32) {
        let Some(progress) = self.progress.get_mut(chain_id) else {
            return;
        };
        if !progress.failed_blocks.is_empty() || progress.is_processing {
            return;
        }
        let batch = adaptive_batch_size(
            &self.config,
            progress.processing_rate,
            progress.error_rate,
            progress.pending_blocks.len(),
        );
        let pending = progress.pending_blocks.len();
        if pending >= self.config.max_pending_blocks
            || pending + batch as usize > self.config.max_pending_blocks
        {
            info!(
                "[{}] backpressure: {} blocks pending (ceiling {}), skipping batch",
                chain_id, pending, self.config.max_pending_blocks
            );
            return;
        }

        let start = progress.dispatch_frontier + 1;
        let end = progress
            .dispatch_frontier
            .saturating_add(batch)
            .min(progress.target_block);
        if start > end {
            return;
        }
        progress.is_processing = true;
        debug!(
            "[{}] dispatching blocks {}..={} (batch size {})",
            chain_id, start, end, batch
        );
        for block in start..=end {
            self.dispatch_block(chain_id, block, 0, priority).await;
        }
        if let Some(progress) = self.progress.get_mut(chain_id) {
            progress.dispatch_frontier = progress.dispatch_frontier.max(end);
            progress.is_processing = false;
        }
    }

    /// Mark a block pending, then hand it to the least-loaded worker
    async fn dispatch_block(&mut self, chain_id: &str, block: u64, attempt: u32, priority: u32) {
        let dispatcher = self.dispatcher.clone();
        let Some(epoch) = self.progress.get(chain_id).map(|p| p.epoch) else {
            return;
        };
        let worker_id = match dispatcher.get_block_worker().await {
            Ok(id) => id,
            Err(e) => {
                warn!("[{}] no worker for block {}: {}", chain_id, block, e);
                if let Some(progress) = self.progress.get_mut(chain_id) {
                    progress.mark_failed(block, true);
                }
                return;
            }
        };

        let now = Instant::now();
        if let Some(progress) = self.progress.get_mut(chain_id) {
            progress.pending_blocks.insert(
                block,
                PendingBlock {
                    worker_id,
                    dispatched_at: now,
                    epoch,
                },
            );
            progress.has_dispatched = true;
        }
        let health = self
            .workers
            .entry(worker_id)
            .or_insert_with(|| WorkerHealth::new(now));
        if health.active_jobs == 0 {
            health.last_active = now;
        }
        health.active_jobs += 1;

        let job = BlockJob {
            chain_id: chain_id.to_string(),
            block_number: block,
            timestamp: unix_now(),
            priority,
            attempt,
            epoch,
        };
        if let Err(e) = dispatcher.add_block_job(worker_id, job).await {
            warn!(
                "[{}] could not queue block {} on worker {}: {}",
                chain_id, block, worker_id, e
            );
            if let Some(progress) = self.progress.get_mut(chain_id) {
                progress.mark_failed(block, true);
            }
            self.recount_active_jobs();
        }
    }

    /// Apply one worker outcome
    pub async fn handle_worker_event(&mut self, event: WorkerEvent) {
        let now = Instant::now();
        // a vanished block is the chain's doing, not the worker's
        let success = matches!(
            event,
            WorkerEvent::JobCompleted { .. } | WorkerEvent::BlockMissing { .. }
        );
        self.workers
            .entry(event.worker_id())
            .or_insert_with(|| WorkerHealth::new(now))
            .record(success, now);

        match event {
            WorkerEvent::JobCompleted {
                job, block_hash, ..
            } => self.on_block_completed(job, block_hash).await,
            WorkerEvent::JobFailed { job, error, .. } => {
                if self.take_outstanding(&job) {
                    warn!(
                        "[{}] block {} failed: {}",
                        job.chain_id, job.block_number, error
                    );
                    self.fail_block(&job.chain_id, job.block_number);
                }
            }
            WorkerEvent::JobStalled { job, .. } => {
                if self.take_outstanding(&job) {
                    warn!("[{}] block {} stalled", job.chain_id, job.block_number);
                    self.fail_block(&job.chain_id, job.block_number);
                }
            }
            WorkerEvent::BlockMissing { job, .. } => {
                if self.take_outstanding(&job) {
                    warn!(
                        "[{}] block {} no longer exists, checking for a reorg",
                        job.chain_id, job.block_number
                    );
                    self.handle_reorg(&job.chain_id, job.block_number).await;
                }
            }
        }
        self.recount_active_jobs();
    }

    /// Claim the pending (or retry-parked) entry a worker outcome refers to
    fn take_outstanding(&mut self, job: &BlockJob) -> bool {
        let Some(progress) = self.progress.get_mut(&job.chain_id) else {
            warn!("outcome for unknown chain {}", job.chain_id);
            return false;
        };
        if progress.halted.is_some() {
            return false;
        }
        if job.epoch != progress.epoch {
            debug!(
                "[{}] ignoring outcome for block {} from epoch {} (now {})",
                job.chain_id, job.block_number, job.epoch, progress.epoch
            );
            return false;
        }
        progress.pending_blocks.remove(&job.block_number).is_some()
            || progress.failed_blocks.remove(&job.block_number)
    }

    fn fail_block(&mut self, chain_id: &str, block: u64) {
        if let Some(progress) = self.progress.get_mut(chain_id) {
            progress.mark_failed(block, true);
        }
    }

    async fn on_block_completed(&mut self, job: BlockJob, block_hash: String) {
        if !self.take_outstanding(&job) {
            return;
        }
        let chain_id = job.chain_id.as_str();
        let block_number = job.block_number;

        let refetched = match self.factory.get_adapter(chain_id).await {
            Ok(adapter) => adapter.get_block(block_number).await,
            Err(e) => Err(e),
        };
        let block = match refetched {
            Ok(block) => block,
            Err(e) => {
                warn!(
                    "[{}] could not verify block {}: {}",
                    chain_id, block_number, e
                );
                self.fail_block(chain_id, block_number);
                return;
            }
        };

        let reorg_threshold = self.config.reorg_threshold;
        let Some(progress) = self.progress.get_mut(chain_id) else {
            return;
        };
        let verified = match &block {
            Some(b) => {
                let parent_ok = block_number
                    .checked_sub(1)
                    .and_then(|parent| progress.block_hashes.get(&parent))
                    .map_or(true, |recorded| *recorded == b.parent_hash);
                b.hash == block_hash && parent_ok
            }
            None => false,
        };

        if verified {
            progress.block_hashes.insert(block_number, block_hash);
            progress.resolved.insert(block_number, true);
            progress.retry_count.remove(&block_number);
            progress.total_processed += 1;
            progress.advance_watermark(reorg_threshold);
            debug!(
                "[{}] block {} verified, processed through {}",
                chain_id, block_number, progress.last_processed_block
            );
        } else {
            warn!(
                "[{}] {}",
                chain_id,
                CrawlError::Reorg {
                    chain: chain_id.to_string(),
                    block: block_number,
                }
            );
            self.handle_reorg(chain_id, block_number).await;
        }
    }

    /// Walk back from `block` to the nearest ancestor that still exists and
    /// matches what was recorded, then rewind progress to it.
    pub async fn handle_reorg(&mut self, chain_id: &str, block: u64) {
        let adapter = match self.factory.get_adapter(chain_id).await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("[{}] reorg recovery deferred: {}", chain_id, e);
                self.fail_block(chain_id, block);
                return;
            }
        };
        let Some(floor) = self
            .progress
            .get(chain_id)
            .map(|p| p.last_verified_block.saturating_sub(self.config.reorg_threshold))
        else {
            return;
        };

        let mut candidate = block.checked_sub(1);
        let mut ancestor = None;
        while let Some(number) = candidate {
            if number < floor {
                break;
            }
            match adapter.get_block(number).await {
                Ok(Some(found)) => {
                    let matches = self
                        .progress
                        .get(chain_id)
                        .and_then(|p| p.recorded_hash(number))
                        .map_or(true, |recorded| recorded == found.hash);
                    if matches {
                        ancestor = Some(number);
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "[{}] reorg walk-back interrupted at block {}: {}",
                        chain_id, number, e
                    );
                    self.fail_block(chain_id, block);
                    return;
                }
            }
            candidate = number.checked_sub(1);
        }

        let Some(progress) = self.progress.get_mut(chain_id) else {
            return;
        };
        match ancestor {
            Some(ancestor) => {
                let rollback_to = ancestor.min(progress.last_processed_block);
                progress.rewind_to(rollback_to);
                warn!(
                    "[{}] reorg at block {}, rolled back to {}",
                    chain_id, block, rollback_to
                );
                self.emit(CoordinatorEvent::ReorgDetected {
                    chain_id: chain_id.to_string(),
                    block_number: block,
                    rollback_to,
                });
            }
            None => {
                let reason = CrawlError::ReorgDepthExceeded {
                    chain: chain_id.to_string(),
                    block,
                    depth: self.config.reorg_threshold,
                }
                .to_string();
                error!("[{}] halting chain: {}", chain_id, reason);
                progress.halted = Some(reason.clone());
                progress.pending_blocks.clear();
                progress.is_processing = false;
                progress.epoch += 1;
                self.emit(CoordinatorEvent::ChainHalted {
                    chain_id: chain_id.to_string(),
                    block_number: block,
                    reason,
                });
            }
        }
        self.recount_active_jobs();
    }

    fn recount_active_jobs(&mut self) {
        let mut counts: HashMap<WorkerId, usize> = HashMap::new();
        for progress in self.progress.values() {
            for pending in progress.pending_blocks.values() {
                *counts.entry(pending.worker_id).or_insert(0) += 1;
            }
        }
        for (id, health) in self.workers.iter_mut() {
            health.active_jobs = counts.get(id).copied().unwrap_or(0);
        }
    }

    /// Restart dead workers and return lost blocks to the retry set
    pub async fn health_check(&mut self) {
        let now = Instant::now();
        for id in self.dispatcher.worker_ids().await {
            self.workers
                .entry(id)
                .or_insert_with(|| WorkerHealth::new(now));
        }
        self.recount_active_jobs();

        let min_rate = self.config.worker_min_success_rate;
        let idle_timeout = self.config.worker_idle_timeout;
        let dead: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, h)| {
                h.success_rate < min_rate
                    || (h.active_jobs > 0 && now.duration_since(h.last_active) > idle_timeout)
            })
            .map(|(id, _)| *id)
            .collect();
        for worker_id in dead {
            self.restart_worker(worker_id).await;
        }

        self.sweep_stalled(now);
        self.publish_status().await;
    }

    async fn restart_worker(&mut self, worker_id: WorkerId) {
        let health = self.workers.get(&worker_id).cloned();
        warn!(
            "Worker {} unhealthy (success rate {:.2}, {} active jobs), restarting",
            worker_id,
            health.as_ref().map_or(0.0, |h| h.success_rate),
            health.as_ref().map_or(0, |h| h.active_jobs)
        );
        if let Err(e) = self.dispatcher.restart_worker(worker_id).await {
            error!("Failed to restart worker {}: {}", worker_id, e);
            return;
        }

        let mut requeued = 0;
        for (chain_id, progress) in self.progress.iter_mut() {
            let owned: Vec<u64> = progress
                .pending_blocks
                .iter()
                .filter(|(_, p)| p.worker_id == worker_id)
                .map(|(block, _)| *block)
                .collect();
            for block in owned {
                debug!("[{}] requeueing block {} from worker {}", chain_id, block, worker_id);
                progress.mark_failed(block, false);
                requeued += 1;
            }
        }
        self.workers.insert(worker_id, WorkerHealth::new(Instant::now()));
        info!("Worker {} restarted, {} blocks requeued", worker_id, requeued);
        self.emit(CoordinatorEvent::WorkerRestarted {
            worker_id,
            requeued,
        });
    }

    /// Pending entries older than twice the stall timeout lost their outcome
    fn sweep_stalled(&mut self, now: Instant) {
        let horizon = self.config.stalled_timeout.saturating_mul(2);
        for (chain_id, progress) in self.progress.iter_mut() {
            let stale: Vec<u64> = progress
                .pending_blocks
                .iter()
                .filter(|(_, p)| now.duration_since(p.dispatched_at) > horizon)
                .map(|(block, _)| *block)
                .collect();
            for block in stale {
                warn!(
                    "[{}] block {} pending for more than {:?}, returning to retry",
                    chain_id, block, horizon
                );
                progress.mark_failed(block, true);
            }
        }
        self.recount_active_jobs();
    }

    /// Reset a chain's progress and lift a halt
    pub fn resync(&mut self, chain_id: &str, from_block: Option<u64>) -> CrawlResult<()> {
        let start_block = self
            .factory
            .chain_config(chain_id)
            .map(|c| c.start_block)
            .ok_or_else(|| CrawlError::UnsupportedChain(chain_id.to_string()))?;
        let from_block = from_block.unwrap_or(start_block);
        let progress = self
            .progress
            .get_mut(chain_id)
            .ok_or_else(|| CrawlError::UnsupportedChain(chain_id.to_string()))?;

        let epoch = progress.epoch + 1;
        *progress = ChainProgress::new(from_block, self.config.target_processing_rate);
        progress.epoch = epoch;
        info!("[{}] resyncing from block {}", chain_id, from_block);
        self.recount_active_jobs();
        self.emit(CoordinatorEvent::ChainResynced {
            chain_id: chain_id.to_string(),
            from_block,
        });
        Ok(())
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let chains = self
            .progress
            .iter()
            .map(|(chain_id, p)| {
                let error = p.halted.clone().or_else(|| p.adapter_error.clone());
                let status = if error.is_some() {
                    SyncStatus::Error
                } else if p.blocks_behind() > SYNCING_THRESHOLD {
                    SyncStatus::Syncing
                } else {
                    SyncStatus::Synced
                };
                ChainStatusReport {
                    chain_id: chain_id.clone(),
                    processed_block: p.last_processed_block,
                    target_block: p.target_block,
                    verified_block: p.last_verified_block,
                    failed_count: p.failed_blocks.len(),
                    pending_count: p.pending_blocks.len(),
                    dropped_count: p.dropped_blocks,
                    processing_rate: p.processing_rate,
                    error_rate: p.error_rate,
                    status,
                    error,
                }
            })
            .collect();
        let workers = self
            .dispatcher
            .queue_metrics()
            .await
            .into_iter()
            .map(|(worker_id, queue)| {
                let health = self.workers.get(&worker_id);
                WorkerStatusReport {
                    worker_id,
                    queue,
                    success_rate: health.map_or(1.0, |h| h.success_rate),
                    active_jobs: health.map_or(0, |h| h.active_jobs),
                    health: WorkerHealthState::classify(&queue),
                }
            })
            .collect();
        CoordinatorStatus {
            chains,
            workers,
            updated_at: unix_now(),
        }
    }

    async fn publish_status(&self) {
        let status = self.status().await;
        self.status.send_replace(status);
    }

    /// Drive the coordinator until shutdown is requested or every handle is dropped
    pub async fn run(
        mut self,
        mut worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
        mut commands: mpsc::Receiver<CoordinatorCommand>,
    ) {
        let mut coordination = tokio::time::interval(self.config.coordination_interval);
        coordination.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.health_check_interval,
            self.config.health_check_interval,
        );
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Coordinator started for {} chains (tick {:?}, health check {:?})",
            self.progress.len(),
            self.config.coordination_interval,
            self.config.health_check_interval
        );

        loop {
            tokio::select! {
                _ = coordination.tick() => self.tick().await,
                _ = health.tick() => self.health_check().await,
                Some(event) = worker_events.recv() => self.handle_worker_event(event).await,
                command = commands.recv() => match command {
                    Some(CoordinatorCommand::Resync { chain_id, from_block, reply }) => {
                        let result = self.resync(&chain_id, from_block);
                        if reply.send(result).is_err() {
                            debug!("resync requester for {} went away", chain_id);
                        }
                        self.publish_status().await;
                    }
                    Some(CoordinatorCommand::Shutdown) | None => {
                        info!("Coordinator stopping");
                        break;
                    }
                },
            }
        }
        self.publish_status().await;
    }

    /// Spawn [`run`](Self::run) and return the handle to control it
    pub fn spawn(
        self,
        worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (commands, commands_rx) = mpsc::channel(16);
        let handle = CoordinatorHandle {
            commands,
            status: self.status.subscribe(),
            events: self.events.clone(),
        };
        let task = tokio::spawn(self.run(worker_events, commands_rx));
        (handle, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAdapterBuilder, MockChainAdapter, RecordingDispatcher};
    use crate::worker::BlockStats;
    use crate::{ChainAdapter, ChainConfig};
    use std::time::Duration;

    struct Harness {
        coordinator: JobCoordinator,
        chain: MockChainAdapter,
        dispatcher: Arc<RecordingDispatcher>,
    }

    fn harness(config: CrawlerConfig, workers: usize, start_block: u64, latest: u64) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let chain = MockChainAdapter::new(
            ChainConfig::new("ethereum", "mock://eth").with_start_block(start_block),
        );
        chain.add_blocks(start_block.saturating_sub(10)..=latest);
        chain.set_latest(latest);
        let factory = Arc::new(ChainAdapterFactory::new(
            vec![chain.config().clone()],
            Arc::new(MockAdapterBuilder::new().with_adapter(chain.clone())),
        ));
        let dispatcher = Arc::new(RecordingDispatcher::new(workers));
        let coordinator = JobCoordinator::new(config, factory, dispatcher.clone()).unwrap();
        Harness {
            coordinator,
            chain,
            dispatcher,
        }
    }

    fn config(max_batch: u64, max_pending: usize) -> CrawlerConfig {
        CrawlerConfig {
            min_blocks_per_batch: 1,
            max_blocks_per_batch: max_batch,
            max_pending_blocks: max_pending,
            ..CrawlerConfig::default()
        }
    }

    fn completed(chain: &MockChainAdapter, worker_id: WorkerId, job: &BlockJob) -> WorkerEvent {
        WorkerEvent::JobCompleted {
            worker_id,
            job: job.clone(),
            block_hash: chain.block_hash(job.block_number).unwrap_or_default(),
            stats: BlockStats::default(),
        }
    }

    fn failed(worker_id: WorkerId, job: &BlockJob) -> WorkerEvent {
        WorkerEvent::JobFailed {
            worker_id,
            job: job.clone(),
            error: "rpc timeout".to_string(),
            retryable: true,
        }
    }

    fn blocks(jobs: &[(WorkerId, BlockJob)]) -> Vec<u64> {
        jobs.iter().map(|(_, j)| j.block_number).collect()
    }

    #[tokio::test]
    async fn test_first_tick_dispatches_clamped_batch() {
        let mut h = harness(config(10, 40), 3, 101, 130);
        h.coordinator.tick().await;

        let jobs = h.dispatcher.take_jobs();
        assert_eq!(blocks(&jobs), (101..=110).collect::<Vec<_>>());
        let progress = h.coordinator.progress("ethereum").unwrap();
        assert_eq!(progress.last_processed_block, 100);
        assert_eq!(progress.target_block, 130);
        assert_eq!(
            progress.pending_blocks.keys().copied().collect::<Vec<_>>(),
            (101..=110).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_confirmations_hold_back_target() {
        let chain = MockChainAdapter::new(
            ChainConfig::new("polygon", "mock://polygon")
                .with_start_block(1)
                .with_confirmations(64),
        );
        chain.add_blocks(0..=100);
        let factory = Arc::new(ChainAdapterFactory::new(
            vec![chain.config().clone()],
            Arc::new(MockAdapterBuilder::new().with_adapter(chain.clone())),
        ));
        let dispatcher = Arc::new(RecordingDispatcher::new(1));
        let mut coordinator =
            JobCoordinator::new(config(100, 400), factory, dispatcher.clone()).unwrap();
        coordinator.tick().await;
        assert_eq!(coordinator.progress("polygon").unwrap().target_block, 36);
        assert!(blocks(&dispatcher.take_jobs()).iter().all(|b| *b <= 36));
    }

    #[tokio::test]
    async fn test_backpressure_skips_whole_batch() {
        let mut h = harness(config(10, 15), 2, 101, 500);
        h.coordinator.tick().await;
        assert_eq!(h.dispatcher.take_jobs().len(), 10);

        h.coordinator.tick().await;
        let second = h.dispatcher.take_jobs();
        let pending = h.coordinator.progress("ethereum").unwrap().pending_blocks.len();
        assert!(pending <= 15);
        assert_eq!(pending, 10 + second.len());

        for _ in 0..5 {
            h.coordinator.tick().await;
            assert!(h.coordinator.progress("ethereum").unwrap().pending_blocks.len() <= 15);
        }
    }

    #[tokio::test]
    async fn test_saturated_chain_dispatches_nothing() {
        let mut h = harness(config(10, 10), 2, 101, 500);
        h.coordinator.tick().await;
        assert_eq!(h.dispatcher.take_jobs().len(), 10);
        h.coordinator.tick().await;
        assert!(h.dispatcher.take_jobs().is_empty());
        assert_eq!(
            h.coordinator.progress("ethereum").unwrap().pending_blocks.len(),
            10
        );
    }

    #[tokio::test]
    async fn test_out_of_order_completion_advances_watermark_contiguously() {
        let mut h = harness(config(5, 20), 2, 101, 130);
        h.coordinator.tick().await;
        let jobs = h.dispatcher.take_jobs();

        // complete 102..=105 first: 101 is still outstanding
        for (worker, job) in jobs.iter().filter(|(_, j)| j.block_number != 101) {
            h.coordinator
                .handle_worker_event(completed(&h.chain, *worker, job))
                .await;
        }
        assert_eq!(
            h.coordinator.progress("ethereum").unwrap().last_processed_block,
            100
        );

        let (worker, job) = &jobs[0];
        h.coordinator
            .handle_worker_event(completed(&h.chain, *worker, job))
            .await;
        let progress = h.coordinator.progress("ethereum").unwrap();
        assert_eq!(progress.last_processed_block, 105);
        assert_eq!(progress.last_verified_block, 105);
        assert!(progress.pending_blocks.is_empty());
    }

    #[tokio::test]
    async fn test_retry_ceiling_drops_block_and_moves_on() {
        let mut cfg = config(1, 8);
        cfg.retry_limit = 2;
        let mut h = harness(cfg, 1, 101, 130);
        let mut events = h.coordinator.subscribe();

        h.coordinator.tick().await;
        let (_, job) = h.dispatcher.take_jobs().remove(0);
        assert_eq!(job.block_number, 101);
        h.coordinator.handle_worker_event(failed(0, &job)).await;

        h.coordinator.tick().await;
        let (_, retry) = h.dispatcher.take_jobs().remove(0);
        assert_eq!((retry.block_number, retry.attempt), (101, 1));
        h.coordinator.handle_worker_event(failed(0, &retry)).await;
        assert_eq!(
            h.coordinator.progress("ethereum").unwrap().retry_count.get(&101),
            Some(&2)
        );

        h.coordinator.tick().await;
        let jobs = h.dispatcher.take_jobs();
        assert_eq!(blocks(&jobs), vec![102]);
        assert_eq!(
            events.try_recv().unwrap(),
            CoordinatorEvent::BlockDropped {
                chain_id: "ethereum".to_string(),
                block_number: 101,
                attempts: 2,
            }
        );
        let progress = h.coordinator.progress("ethereum").unwrap();
        assert!(progress.failed_blocks.is_empty());
        assert_eq!(progress.dropped_blocks, 1);
        assert_eq!(progress.last_processed_block, 101);
        assert_eq!(progress.last_verified_block, 100);

        h.coordinator
            .handle_worker_event(completed(&h.chain, 0, &jobs[0].1))
            .await;
        let progress = h.coordinator.progress("ethereum").unwrap();
        assert_eq!(progress.last_processed_block, 102);
        assert_eq!(progress.last_verified_block, 102);
    }

    #[tokio::test]
    async fn test_failed_blocks_are_retried_before_new_batches() {
        let mut h = harness(config(3, 12), 1, 101, 130);
        h.coordinator.tick().await;
        let jobs = h.dispatcher.take_jobs();
        h.coordinator.handle_worker_event(failed(0, &jobs[1].1)).await;

        h.coordinator.tick().await;
        let retried = h.dispatcher.take_jobs();
        assert_eq!(blocks(&retried), vec![102]);
        assert_eq!(retried[0].1.attempt, 1);
    }

    #[tokio::test]
    async fn test_vanished_block_rolls_back_to_existing_ancestor() {
        let mut h = harness(config(10, 40), 2, 101, 130);
        let mut events = h.coordinator.subscribe();
        h.coordinator.tick().await;
        let jobs = h.dispatcher.take_jobs();

        for (worker, job) in jobs.iter().take(4) {
            h.coordinator
                .handle_worker_event(completed(&h.chain, *worker, job))
                .await;
        }
        assert_eq!(
            h.coordinator.progress("ethereum").unwrap().last_processed_block,
            104
        );

        let (worker, job105) = jobs[4].clone();
        let stale_event = completed(&h.chain, worker, &job105);
        h.chain.remove_block(104);
        h.chain.remove_block(105);
        h.coordinator.handle_worker_event(stale_event).await;

        let progress = h.coordinator.progress("ethereum").unwrap();
        assert_eq!(progress.last_processed_block, 103);
        assert_eq!(progress.last_verified_block, 103);
        assert!(progress.pending_blocks.is_empty());
        assert_eq!(progress.epoch, 1);
        assert_eq!(
            events.try_recv().unwrap(),
            CoordinatorEvent::ReorgDetected {
                chain_id: "ethereum".to_string(),
                block_number: 105,
                rollback_to: 103,
            }
        );

        // jobs issued before the reorg are abandoned
        let (worker, job106) = &jobs[5];
        h.coordinator
            .handle_worker_event(completed(&h.chain, *worker, job106))
            .await;
        assert_eq!(
            h.coordinator.progress("ethereum").unwrap().last_processed_block,
            103
        );

        h.chain.add_blocks(104..=105);
        h.coordinator.tick().await;
        let redispatched = h.dispatcher.take_jobs();
        assert_eq!(redispatched[0].1.block_number, 104);
        assert!(redispatched.iter().all(|(_, j)| j.epoch == 1));
    }

    #[tokio::test]
    async fn test_missing_block_from_worker_triggers_rollback() {
        let mut h = harness(config(10, 40), 2, 101, 130);
        let mut events = h.coordinator.subscribe();
        h.coordinator.tick().await;
        let jobs = h.dispatcher.take_jobs();
        for (worker, job) in jobs.iter().take(4) {
            h.coordinator
                .handle_worker_event(completed(&h.chain, *worker, job))
                .await;
        }

        // the node dropped 104 and 105 before the worker fetched 105
        h.chain.remove_block(104);
        h.chain.remove_block(105);
        let (worker, job105) = jobs[4].clone();
        h.coordinator
            .handle_worker_event(WorkerEvent::BlockMissing {
                worker_id: worker,
                job: job105,
            })
            .await;

        let progress = h.coordinator.progress("ethereum").unwrap();
        assert_eq!(progress.last_processed_block, 103);
        assert!(progress.pending_blocks.is_empty());
        assert!(progress.failed_blocks.is_empty());
        assert_eq!(progress.epoch, 1);
        assert_eq!(
            events.try_recv().unwrap(),
            CoordinatorEvent::ReorgDetected {
                chain_id: "ethereum".to_string(),
                block_number: 105,
                rollback_to: 103,
            }
        );
        assert!(h.coordinator.workers[&worker].success_rate > 0.99);

        // a stale report for the same block is ignored after the rewind
        h.coordinator
            .handle_worker_event(WorkerEvent::BlockMissing {
                worker_id: worker,
                job: jobs[4].1.clone(),
            })
            .await;
        assert_eq!(h.coordinator.progress("ethereum").unwrap().epoch, 1);
    }

    #[tokio::test]
    async fn test_forked_block_with_changed_hash_is_a_reorg() {
        let mut h = harness(config(4, 16), 1, 101, 130);
        h.coordinator.tick().await;
        let jobs = h.dispatcher.take_jobs();
        for (worker, job) in jobs.iter().take(2) {
            h.coordinator
                .handle_worker_event(completed(&h.chain, *worker, job))
                .await;
        }

        // worker saw the old 103, the chain has since replaced 102 onward
        let event = completed(&h.chain, 0, &jobs[2].1);
        h.chain.fork_from(102);
        h.coordinator.handle_worker_event(event).await;

        let progress = h.coordinator.progress("ethereum").unwrap();
        assert_eq!(progress.last_processed_block, 101);
        assert_eq!(progress.recorded_hash(102), None);
    }

    #[tokio::test]
    async fn test_reorg_beyond_threshold_halts_chain() {
        let mut cfg = config(4, 16);
        cfg.reorg_threshold = 2;
        let mut h = harness(cfg, 1, 101, 130);
        let mut events = h.coordinator.subscribe();
        h.coordinator.tick().await;
        let jobs = h.dispatcher.take_jobs();
        for (worker, job) in jobs.iter().take(2) {
            h.coordinator
                .handle_worker_event(completed(&h.chain, *worker, job))
                .await;
        }

        let event = completed(&h.chain, 0, &jobs[2].1);
        for n in 95..=105 {
            h.chain.remove_block(n);
        }
        h.coordinator.handle_worker_event(event).await;

        assert!(matches!(
            events.try_recv().unwrap(),
            CoordinatorEvent::ChainHalted { block_number: 103, .. }
        ));
        let status = h.coordinator.status().await;
        assert_eq!(status.chain("ethereum").unwrap().status, SyncStatus::Error);

        h.coordinator.tick().await;
        assert!(h.dispatcher.take_jobs().is_empty());

        h.chain.add_blocks(95..=130);
        h.coordinator.resync("ethereum", Some(100)).unwrap();
        let progress = h.coordinator.progress("ethereum").unwrap();
        assert!(progress.halted.is_none());
        assert_eq!(progress.last_processed_block, 99);
        h.coordinator.tick().await;
        assert_eq!(h.dispatcher.take_jobs()[0].1.block_number, 100);
    }

    #[tokio::test]
    async fn test_unhealthy_worker_restart_requeues_its_blocks() {
        let mut h = harness(config(4, 16), 2, 101, 130);
        let mut events = h.coordinator.subscribe();
        h.coordinator.tick().await;
        let jobs = h.dispatcher.take_jobs();
        assert_eq!(jobs.iter().filter(|(w, _)| *w == 0).count(), 2);

        // four failures from an abandoned epoch only dent worker 0's health
        let mut foreign = jobs[0].1.clone();
        foreign.epoch = 99;
        for _ in 0..4 {
            h.coordinator.handle_worker_event(failed(0, &foreign)).await;
        }
        assert!(h.coordinator.worker_success_rate(0).unwrap() < 0.7);

        h.coordinator.health_check().await;
        assert_eq!(h.dispatcher.restarts(), vec![0]);
        let progress = h.coordinator.progress("ethereum").unwrap();
        assert_eq!(
            progress.failed_blocks.iter().copied().collect::<Vec<_>>(),
            vec![101, 103]
        );
        assert_eq!(
            progress.pending_blocks.keys().copied().collect::<Vec<_>>(),
            vec![102, 104]
        );
        assert!(progress.retry_count.is_empty());
        assert_eq!(
            events.try_recv().unwrap(),
            CoordinatorEvent::WorkerRestarted {
                worker_id: 0,
                requeued: 2
            }
        );
        assert_eq!(h.coordinator.worker_success_rate(0), Some(1.0));

        h.coordinator.tick().await;
        let retried = h.dispatcher.take_jobs();
        assert_eq!(blocks(&retried), vec![101, 103]);
        assert!(retried.iter().all(|(_, j)| j.attempt == 0));
    }

    #[tokio::test]
    async fn test_idle_worker_holding_jobs_is_restarted() {
        let mut cfg = config(2, 8);
        cfg.worker_idle_timeout = Duration::from_millis(5);
        let mut h = harness(cfg, 2, 101, 130);
        h.coordinator.tick().await;
        h.dispatcher.take_jobs();
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.coordinator.health_check().await;
        let mut restarts = h.dispatcher.restarts();
        restarts.sort();
        assert_eq!(restarts, vec![0, 1]);
        assert!(h
            .coordinator
            .progress("ethereum")
            .unwrap()
            .pending_blocks
            .is_empty());
    }

    #[tokio::test]
    async fn test_idle_worker_without_jobs_is_left_alone() {
        let mut cfg = config(2, 8);
        cfg.worker_idle_timeout = Duration::from_millis(1);
        let mut h = harness(cfg, 2, 101, 101);
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.coordinator.health_check().await;
        assert!(h.dispatcher.restarts().is_empty());
    }

    #[tokio::test]
    async fn test_lost_pending_block_is_swept_to_retry() {
        let mut cfg = config(1, 4);
        cfg.stalled_timeout = Duration::from_millis(1);
        let mut h = harness(cfg, 1, 101, 130);
        h.coordinator.tick().await;
        h.dispatcher.take_jobs();
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.coordinator.health_check().await;
        let progress = h.coordinator.progress("ethereum").unwrap();
        assert!(progress.pending_blocks.is_empty());
        assert!(progress.failed_blocks.contains(&101));
        assert_eq!(progress.retry_count.get(&101), Some(&1));
    }

    #[tokio::test]
    async fn test_dispatch_rejection_parks_block_for_retry() {
        let mut h = harness(config(2, 8), 1, 101, 130);
        h.dispatcher.set_rejecting(true);
        h.coordinator.tick().await;
        let progress = h.coordinator.progress("ethereum").unwrap();
        assert!(progress.pending_blocks.is_empty());
        assert_eq!(progress.failed_blocks.len(), 2);

        h.dispatcher.set_rejecting(false);
        h.coordinator.tick().await;
        assert_eq!(blocks(&h.dispatcher.take_jobs()), vec![101, 102]);
    }

    #[tokio::test]
    async fn test_unreachable_head_marks_chain_error() {
        let mut h = harness(config(2, 8), 1, 101, 130);
        h.chain.set_latest_error(true);
        h.coordinator.tick().await;
        assert!(h.dispatcher.take_jobs().is_empty());
        let status = h.coordinator.status_receiver().borrow().clone();
        assert_eq!(status.chain("ethereum").unwrap().status, SyncStatus::Error);

        h.chain.set_latest_error(false);
        h.coordinator.tick().await;
        assert_eq!(h.dispatcher.take_jobs().len(), 2);
    }

    #[tokio::test]
    async fn test_most_behind_chain_is_scheduled_first() {
        let eth = MockChainAdapter::new(ChainConfig::new("ethereum", "mock://eth").with_start_block(1));
        eth.add_blocks(0..=5000);
        let bsc = MockChainAdapter::new(ChainConfig::new("bsc", "mock://bsc").with_start_block(1));
        bsc.add_blocks(0..=20);
        let factory = Arc::new(ChainAdapterFactory::new(
            vec![eth.config().clone(), bsc.config().clone()],
            Arc::new(
                MockAdapterBuilder::new()
                    .with_adapter(eth.clone())
                    .with_adapter(bsc.clone()),
            ),
        ));
        let dispatcher = Arc::new(RecordingDispatcher::new(2));
        let mut cfg = config(4, 16);
        cfg.max_concurrent_chains = 1;
        let mut coordinator = JobCoordinator::new(cfg, factory, dispatcher.clone()).unwrap();

        coordinator.tick().await;
        let jobs = dispatcher.take_jobs();
        assert!(!jobs.is_empty());
        assert!(jobs.iter().all(|(_, j)| j.chain_id == "ethereum"));
        assert_eq!(coordinator.progress("bsc").unwrap().target_block, 20);
        assert_eq!(coordinator.progress("bsc").unwrap().dispatch_frontier(), 0);
    }

    #[test]
    fn test_batch_size_stays_within_bounds() {
        let cfg = config(16, 64);
        for rate in [0.0, 0.4, 3.0, 10.0, 1_000.0, f64::INFINITY] {
            for error_rate in [0.0, 0.05, 0.5, 7.0] {
                for pending in [0usize, 10, 52, 64, 200] {
                    let size = adaptive_batch_size(&cfg, rate, error_rate, pending);
                    assert!((cfg.min_blocks_per_batch..=cfg.max_blocks_per_batch).contains(&size));
                }
            }
        }
        assert_eq!(adaptive_batch_size(&cfg, 10.0, 0.0, 0), 10);
        assert_eq!(adaptive_batch_size(&cfg, 10.0, 0.5, 0), 8);
        assert_eq!(adaptive_batch_size(&cfg, 10.0, 0.0, 60), 5);
    }

    #[test]
    fn test_priority_blends_lag_rate_errors_and_staleness() {
        let mut progress = ChainProgress::new(1, 10.0);
        progress.target_block = 10;
        let now = Instant::now();
        // 0.4·10 + 0.3·0 + 0.2·1 + 0.1·1
        assert!((chain_priority(&progress, 10.0, now) - 4.3).abs() < 1e-9);

        progress.processing_rate = 0.0;
        progress.error_rate = 2.0;
        progress.last_scheduled = Some(now);
        assert!((chain_priority(&progress, 10.0, now) - 4.3).abs() < 1e-9);
    }

    #[test]
    fn test_worker_health_classification() {
        let healthy = QueueMetrics {
            completed: 100,
            failed: 10,
            ..Default::default()
        };
        assert_eq!(WorkerHealthState::classify(&healthy), WorkerHealthState::Healthy);
        let failing = QueueMetrics {
            completed: 100,
            failed: 11,
            ..Default::default()
        };
        assert_eq!(WorkerHealthState::classify(&failing), WorkerHealthState::Error);
        let backed_up = QueueMetrics {
            delayed: 101,
            ..Default::default()
        };
        assert_eq!(WorkerHealthState::classify(&backed_up), WorkerHealthState::Warning);
    }

    #[tokio::test]
    async fn test_handle_resync_and_shutdown_through_running_loop() {
        let mut cfg = config(2, 8);
        cfg.coordination_interval = Duration::from_millis(10);
        let h = harness(cfg, 1, 101, 130);
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let (handle, task) = h.coordinator.spawn(events_rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.status().chain("ethereum").unwrap().pending_count > 0);

        handle.resync("ethereum", Some(120)).await.unwrap();
        assert!(matches!(
            handle.resync("solana", None).await,
            Err(CrawlError::UnsupportedChain(_))
        ));

        handle.shutdown().await;
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}

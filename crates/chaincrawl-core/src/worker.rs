//! # Block Worker Pool
//!
//! A fixed set of [`BlockWorker`]s, each consuming its own job queue. A job
//! fetches one block, walks every transaction receipt and hands each decoded
//! log to the [`EventSink`]. Failures below the block level (one receipt, one
//! log, one handler call) are logged and counted but never fail the job.
//!
//! Workers never touch coordinator state. Every outcome is reported as a
//! [`WorkerEvent`] on a channel owned by the coordinator.
//!
//! Retried jobs (`attempt > 0`) are held back for `backoff_delay × 2^(attempt-1)`
//! before they enter a queue and show up as `delayed` in the queue metrics
//! meanwhile.

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use crate::{
    Block, BlockJob, ChainAdapter, ChainAdapterFactory, CrawlError, CrawlResult, CrawlerConfig,
    EventSink, JobDispatcher, QueueMetrics, WorkerId,
};

/// Outcome of one job attempt, sent to the coordinator
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    JobCompleted {
        worker_id: WorkerId,
        job: BlockJob,
        block_hash: String,
        stats: BlockStats,
    },
    JobFailed {
        worker_id: WorkerId,
        job: BlockJob,
        error: String,
        retryable: bool,
    },
    JobStalled {
        worker_id: WorkerId,
        job: BlockJob,
    },
    /// The node no longer has the block, usually because it was reorganized away
    BlockMissing {
        worker_id: WorkerId,
        job: BlockJob,
    },
}

impl WorkerEvent {
    pub fn worker_id(&self) -> WorkerId {
        match self {
            WorkerEvent::JobCompleted { worker_id, .. }
            | WorkerEvent::JobFailed { worker_id, .. }
            | WorkerEvent::JobStalled { worker_id, .. }
            | WorkerEvent::BlockMissing { worker_id, .. } => *worker_id,
        }
    }

    pub fn job(&self) -> &BlockJob {
        match self {
            WorkerEvent::JobCompleted { job, .. }
            | WorkerEvent::JobFailed { job, .. }
            | WorkerEvent::JobStalled { job, .. }
            | WorkerEvent::BlockMissing { job, .. } => job,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub transactions: usize,
    pub logs: usize,
    pub events: usize,
    pub decode_failures: usize,
    pub transaction_failures: usize,
    pub handler_failures: usize,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub stalled_timeout: Duration,
    pub backoff_delay: Duration,
}

impl From<&CrawlerConfig> for WorkerSettings {
    fn from(config: &CrawlerConfig) -> Self {
        Self {
            stalled_timeout: config.stalled_timeout,
            backoff_delay: config.backoff_delay,
        }
    }
}

impl WorkerSettings {
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow((attempt - 1).min(10));
        self.backoff_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    waiting: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    delayed: AtomicU64,
}

impl QueueCounters {
    fn snapshot(&self) -> QueueMetrics {
        QueueMetrics {
            waiting: self.waiting.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            delayed: self.delayed.load(Ordering::SeqCst),
        }
    }

    fn decrement(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
    }
}

/// Executes block jobs from one queue
pub struct BlockWorker {
    id: WorkerId,
    factory: Arc<ChainAdapterFactory>,
    sink: Arc<dyn EventSink>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    counters: Arc<QueueCounters>,
    paused: Arc<AtomicBool>,
    settings: WorkerSettings,
}

impl BlockWorker {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Fetch a block and run every log of every transaction through the sink.
    ///
    /// Returns the hash of the block as seen by this fetch.
    pub async fn process_block(&self, job: &BlockJob) -> CrawlResult<(String, BlockStats)> {
        let adapter = self.factory.get_adapter(&job.chain_id).await?;
        let block = adapter
            .get_block(job.block_number)
            .await?
            .ok_or_else(|| CrawlError::BlockNotFound {
                chain: job.chain_id.clone(),
                block: job.block_number,
            })?;

        let mut stats = BlockStats::default();
        for tx_hash in &block.transactions {
            stats.transactions += 1;
            if let Err(e) = self
                .process_transaction(adapter.as_ref(), &block, tx_hash, &mut stats)
                .await
            {
                stats.transaction_failures += 1;
                warn!(
                    "[{}] block {} transaction {} skipped: {}",
                    job.chain_id, job.block_number, tx_hash, e
                );
            }
        }

        debug!(
            "[{}] worker {} processed block {}: {} txs, {} events",
            job.chain_id, self.id, job.block_number, stats.transactions, stats.events
        );
        Ok((block.hash, stats))
    }

    async fn process_transaction(
        &self,
        adapter: &dyn ChainAdapter,
        block: &Block,
        tx_hash: &str,
        stats: &mut BlockStats,
    ) -> CrawlResult<()> {
        let Some(receipt) = adapter.get_transaction_receipt(tx_hash).await? else {
            debug!("[{}] no receipt for {}", adapter.chain_id(), tx_hash);
            return Ok(());
        };

        for log in &receipt.logs {
            stats.logs += 1;
            match adapter.decode_log(log, block.timestamp) {
                Ok(Some(event)) => {
                    stats.events += 1;
                    if let Err(e) = self.sink.handle_event(event).await {
                        stats.handler_failures += 1;
                        warn!(
                            "[{}] handling event from {}#{} failed: {}",
                            adapter.chain_id(),
                            tx_hash,
                            log.log_index,
                            e
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    stats.decode_failures += 1;
                    debug!(
                        "[{}] undecodable log {}#{}: {}",
                        adapter.chain_id(),
                        tx_hash,
                        log.log_index,
                        e
                    );
                }
            }
        }
        Ok(())
    }

    async fn run(self, mut queue: mpsc::UnboundedReceiver<BlockJob>) {
        while let Some(job) = queue.recv().await {
            if self.paused.load(Ordering::SeqCst) {
                QueueCounters::decrement(&self.counters.waiting);
                debug!(
                    "[{}] worker {} paused, leaving block {} unprocessed",
                    job.chain_id, self.id, job.block_number
                );
                continue;
            }

            self.counters.active.fetch_add(1, Ordering::SeqCst);
            QueueCounters::decrement(&self.counters.waiting);
            let outcome =
                tokio::time::timeout(self.settings.stalled_timeout, self.process_block(&job)).await;
            QueueCounters::decrement(&self.counters.active);

            let event = match outcome {
                Ok(Ok((block_hash, stats))) => {
                    self.counters.completed.fetch_add(1, Ordering::SeqCst);
                    WorkerEvent::JobCompleted {
                        worker_id: self.id,
                        job,
                        block_hash,
                        stats,
                    }
                }
                Ok(Err(CrawlError::BlockNotFound { .. })) => {
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        "[{}] worker {}: block {} not found on the node",
                        job.chain_id, self.id, job.block_number
                    );
                    WorkerEvent::BlockMissing {
                        worker_id: self.id,
                        job,
                    }
                }
                Ok(Err(e)) => {
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        "[{}] worker {} failed block {}: {}",
                        job.chain_id, self.id, job.block_number, e
                    );
                    WorkerEvent::JobFailed {
                        worker_id: self.id,
                        retryable: e.is_retryable(),
                        error: e.to_string(),
                        job,
                    }
                }
                Err(_) => {
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        "[{}] worker {} stalled on block {} after {:?}",
                        job.chain_id, self.id, job.block_number, self.settings.stalled_timeout
                    );
                    WorkerEvent::JobStalled {
                        worker_id: self.id,
                        job,
                    }
                }
            };

            if self.events.send(event).is_err() {
                debug!("worker {}: coordinator no longer listening", self.id);
            }
        }
        debug!("worker {} queue closed", self.id);
    }
}

struct WorkerSlot {
    id: WorkerId,
    queue: mpsc::UnboundedSender<BlockJob>,
    counters: Arc<QueueCounters>,
    handle: JoinHandle<()>,
}

/// Pool of [`BlockWorker`]s with least-loaded dispatch
pub struct WorkerManager {
    factory: Arc<ChainAdapterFactory>,
    sink: Arc<dyn EventSink>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    settings: WorkerSettings,
    paused: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    slots: RwLock<Vec<WorkerSlot>>,
}

impl WorkerManager {
    /// Spawn `concurrency` workers. The returned receiver carries every job outcome.
    pub fn start(
        concurrency: usize,
        settings: WorkerSettings,
        factory: Arc<ChainAdapterFactory>,
        sink: Arc<dyn EventSink>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let mut manager = Self {
            factory,
            sink,
            events,
            settings,
            paused: Arc::new(AtomicBool::new(false)),
            shutdown,
            slots: RwLock::new(Vec::new()),
        };
        let slots = (0..concurrency.max(1))
            .map(|id| manager.spawn_worker(id))
            .collect();
        *manager.slots.get_mut() = slots;
        info!("Started {} block workers", concurrency.max(1));
        (manager, events_rx)
    }

    fn spawn_worker(&self, id: WorkerId) -> WorkerSlot {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(QueueCounters::default());
        let worker = BlockWorker {
            id,
            factory: self.factory.clone(),
            sink: self.sink.clone(),
            events: self.events.clone(),
            counters: counters.clone(),
            paused: self.paused.clone(),
            settings: self.settings.clone(),
        };
        WorkerSlot {
            id,
            queue,
            counters,
            handle: tokio::spawn(worker.run(queue_rx)),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Pause every queue and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        info!("Pausing block workers and draining in-flight jobs");
        self.paused.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut slots = self.slots.write().await;
            slots.drain(..).map(|slot| slot.handle).collect()
        };
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("worker task ended abnormally: {}", e);
            }
        }
        info!("Block workers stopped");
    }
}

#[async_trait]
impl JobDispatcher for WorkerManager {
    async fn get_block_worker(&self) -> CrawlResult<WorkerId> {
        if self.is_paused() {
            return Err(CrawlError::Queue("worker pool is paused".to_string()));
        }
        let slots = self.slots.read().await;
        slots
            .iter()
            .min_by_key(|slot| (slot.counters.snapshot().depth(), slot.id))
            .map(|slot| slot.id)
            .ok_or_else(|| CrawlError::Queue("no block workers available".to_string()))
    }

    async fn add_block_job(&self, worker_id: WorkerId, job: BlockJob) -> CrawlResult<()> {
        if self.is_paused() {
            return Err(CrawlError::Queue("worker pool is paused".to_string()));
        }
        let slots = self.slots.read().await;
        let slot = slots
            .iter()
            .find(|slot| slot.id == worker_id)
            .ok_or(CrawlError::WorkerUnavailable(worker_id))?;

        let delay = self.settings.retry_delay(job.attempt);
        if delay.is_zero() {
            slot.counters.waiting.fetch_add(1, Ordering::SeqCst);
            if slot.queue.send(job).is_err() {
                QueueCounters::decrement(&slot.counters.waiting);
                return Err(CrawlError::WorkerUnavailable(worker_id));
            }
            return Ok(());
        }

        let queue = slot.queue.clone();
        let counters = slot.counters.clone();
        let mut shutdown = self.shutdown.subscribe();
        counters.delayed.fetch_add(1, Ordering::SeqCst);
        debug!(
            "[{}] block {} delayed {:?} before attempt {}",
            job.chain_id,
            job.block_number,
            delay,
            job.attempt + 1
        );
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    QueueCounters::decrement(&counters.delayed);
                    counters.waiting.fetch_add(1, Ordering::SeqCst);
                    if queue.send(job).is_err() {
                        QueueCounters::decrement(&counters.waiting);
                    }
                }
                _ = shutdown.changed() => {
                    QueueCounters::decrement(&counters.delayed);
                }
            }
        });
        Ok(())
    }

    async fn restart_worker(&self, worker_id: WorkerId) -> CrawlResult<()> {
        let mut slots = self.slots.write().await;
        let index = slots
            .iter()
            .position(|slot| slot.id == worker_id)
            .ok_or(CrawlError::WorkerUnavailable(worker_id))?;
        slots[index].handle.abort();
        slots[index] = self.spawn_worker(worker_id);
        info!("Restarted block worker {}", worker_id);
        Ok(())
    }

    async fn worker_ids(&self) -> Vec<WorkerId> {
        self.slots.read().await.iter().map(|slot| slot.id).collect()
    }

    async fn queue_metrics(&self) -> Vec<(WorkerId, QueueMetrics)> {
        self.slots
            .read()
            .await
            .iter()
            .map(|slot| (slot.id, slot.counters.snapshot()))
            .collect()
    }
}

//! Keyed adaptive batch executor
//!
//! Decouples event producers from delivery work with a bounded staging
//! queue, a set of keyed serial lanes, and drain loops that move staged
//! operations into lanes in adaptive batches. All operations sharing a
//! key execute on the same lane in submission order; unrelated keys
//! proceed in parallel.
//!
//! Flow:
//! - `submit` stages an operation, rejecting immediately when the queue
//!   is full (no blocking, no retry)
//! - drain loops tick on a fixed schedule and route up to
//!   `clamp(depth/2, base, 4*base)` operations to lanes by key hash
//! - a background monitor grows or shrinks the lane/drain counts on
//!   queue-depth watermarks, rate-limited by a cooldown
//! - when a lane's buffer is full the drain task runs the operation
//!   inline instead of dropping it
//!
//! Resizing is generation-counted: the retiring generation's drain
//! loops finish their current iteration and its lanes run down their
//! backlog before the next generation starts, so no in-flight operation
//! is lost.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A unit of work routed by key. Runs on a lane task (or inline under
/// saturation), so it must not block for long.
pub type Operation = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Errors surfaced to submitters.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The staging queue is at capacity.
    #[error("staging queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The executor is shut down or was never started.
    #[error("executor is not accepting work")]
    ShutDown,
}

/// Configuration for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Staging queue capacity; submits beyond this are rejected.
    pub queue_capacity: usize,
    /// Baseline number of operations a drain iteration moves.
    pub base_batch_size: usize,
    /// Interval between drain iterations.
    pub drain_interval: Duration,
    /// Lane count bounds (serial lanes keyed by hash).
    pub min_lanes: usize,
    pub max_lanes: usize,
    /// Drain loop count bounds.
    pub min_drain_loops: usize,
    pub max_drain_loops: usize,
    /// Per-lane buffered operation count before caller-runs kicks in.
    pub lane_buffer: usize,
    /// Queue-depth sampling interval for the scaling monitor.
    pub monitor_interval: Duration,
    /// Minimum time between scale actions.
    pub scale_cooldown: Duration,
    /// Depth above which the monitor grows lanes/drains.
    pub high_watermark: usize,
    /// Depth below which the monitor shrinks lanes/drains.
    pub low_watermark: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let base_batch_size = 500;
        Self {
            queue_capacity: 50_000,
            base_batch_size,
            drain_interval: Duration::from_millis(10),
            min_lanes: 4,
            max_lanes: 32,
            min_drain_loops: 2,
            max_drain_loops: 8,
            lane_buffer: 256,
            monitor_interval: Duration::from_secs(2),
            scale_cooldown: Duration::from_secs(5),
            high_watermark: base_batch_size * 8,
            low_watermark: base_batch_size * 2,
        }
    }
}

/// Awaitable outcome of a submitted operation.
pub struct CompletionHandle {
    rx: oneshot::Receiver<anyhow::Result<()>>,
}

impl CompletionHandle {
    /// Wait for the operation to finish and return its result.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("operation abandoned during shutdown")),
        }
    }
}

/// Point-in-time counters. `submitted == completed + failed + rejected`
/// once the executor is quiescent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub caller_runs: u64,
    pub queue_depth: usize,
    pub lanes: usize,
    pub drain_loops: usize,
}

struct QueuedOperation {
    key_hash: u64,
    op: Operation,
    done: oneshot::Sender<anyhow::Result<()>>,
}

/// One generation of lanes and drain loops. Retired wholesale on resize.
struct Generation {
    lane_txs: Vec<mpsc::Sender<QueuedOperation>>,
    lane_handles: Vec<JoinHandle<()>>,
    drain_handles: Vec<JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
}

struct Inner {
    config: ExecutorConfig,
    queue: Mutex<VecDeque<QueuedOperation>>,
    depth: AtomicUsize,
    accepting: AtomicBool,
    started: AtomicBool,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    caller_runs: AtomicU64,
    lanes: AtomicUsize,
    drain_loops: AtomicUsize,
    generation: tokio::sync::Mutex<Option<Generation>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Bounded, self-scaling keyed executor. Cheap to clone; all clones
/// share the same queue and lanes.
#[derive(Clone)]
pub struct AdaptiveBatchExecutor {
    inner: Arc<Inner>,
}

impl AdaptiveBatchExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let lanes = config.min_lanes;
        let drains = config.min_drain_loops;
        Self {
            inner: Arc::new(Inner {
                config,
                queue: Mutex::new(VecDeque::new()),
                depth: AtomicUsize::new(0),
                accepting: AtomicBool::new(false),
                started: AtomicBool::new(false),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                caller_runs: AtomicU64::new(0),
                lanes: AtomicUsize::new(lanes),
                drain_loops: AtomicUsize::new(drains),
                generation: tokio::sync::Mutex::new(None),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Spawn the initial lane/drain generation and the scaling monitor.
    /// Idempotent.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let lanes = self.inner.config.min_lanes;
        let drains = self.inner.config.min_drain_loops;
        {
            let mut guard = self.inner.generation.lock().await;
            *guard = Some(spawn_generation(self.inner.clone(), lanes, drains));
        }
        self.inner.accepting.store(true, Ordering::SeqCst);

        let monitor = tokio::spawn(monitor_loop(self.inner.clone(), self.clone()));
        if let Ok(mut slot) = self.inner.monitor.lock() {
            *slot = Some(monitor);
        }

        info!(lanes, drain_loops = drains, "executor started");
    }

    /// Stage an operation for keyed execution.
    ///
    /// Rejects immediately when the queue is full or the executor is
    /// not accepting work. Every call is counted as submitted, so the
    /// stats invariant includes rejected operations.
    pub fn submit<F>(&self, key: &str, op: F) -> Result<CompletionHandle, SubmitError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);

        if !self.inner.accepting.load(Ordering::SeqCst) {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SubmitError::ShutDown);
        }

        let capacity = self.inner.config.queue_capacity;
        let reserved = self
            .inner
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| {
                if d < capacity {
                    Some(d + 1)
                } else {
                    None
                }
            });
        if reserved.is_err() {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(key, capacity, "rejecting operation, queue full");
            return Err(SubmitError::QueueFull { capacity });
        }

        let (done, rx) = oneshot::channel();
        let queued = QueuedOperation {
            key_hash: hash_key(key),
            op: Box::new(op),
            done,
        };
        match self.inner.queue.lock() {
            Ok(mut queue) => queue.push_back(queued),
            Err(poisoned) => poisoned.into_inner().push_back(queued),
        }

        Ok(CompletionHandle { rx })
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            caller_runs: self.inner.caller_runs.load(Ordering::Relaxed),
            queue_depth: self.inner.depth.load(Ordering::SeqCst),
            lanes: self.inner.lanes.load(Ordering::SeqCst),
            drain_loops: self.inner.drain_loops.load(Ordering::SeqCst),
        }
    }

    /// Stop intake, run down the backlog, and retire all tasks.
    ///
    /// Remaining staged operations execute inline so their completion
    /// handles always resolve.
    pub async fn shutdown(&self) {
        if !self.inner.started.load(Ordering::SeqCst) {
            return;
        }
        self.inner.accepting.store(false, Ordering::SeqCst);

        // Flush whatever the drain loops have not picked up yet.
        // A bounded number of passes; intake is closed so the queue
        // only shrinks.
        for _ in 0..3 {
            let batch = take_batch(&self.inner, usize::MAX);
            if batch.is_empty() {
                break;
            }
            for queued in batch {
                execute(&self.inner, queued, true);
            }
        }

        let monitor = match self.inner.monitor.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = monitor {
            handle.abort();
        }

        let generation = self.inner.generation.lock().await.take();
        if let Some(generation) = generation {
            retire_generation(generation).await;
        }

        info!(stats = ?self.stats(), "executor shut down");
    }

    /// Swap in a new generation with the given lane/drain counts.
    async fn resize(&self, lanes: usize, drains: usize) {
        let mut guard = self.inner.generation.lock().await;
        let old = guard.take();
        if let Some(old) = old {
            retire_generation(old).await;
        }
        *guard = Some(spawn_generation(self.inner.clone(), lanes, drains));
        info!(lanes, drain_loops = drains, "executor resized");
    }
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Adaptive batch size: half the backlog, clamped to [base, 4*base].
fn adaptive_batch_size(depth: usize, base: usize) -> usize {
    (depth / 2).clamp(base, base * 4)
}

/// Scaling decision from one monitor sample. Pure so it can be tested
/// without timers.
fn scale_decision(
    depth: usize,
    lanes: usize,
    drains: usize,
    config: &ExecutorConfig,
) -> Option<(usize, usize)> {
    if depth > config.high_watermark && lanes < config.max_lanes {
        Some((
            (lanes * 2).min(config.max_lanes),
            (drains * 2).min(config.max_drain_loops),
        ))
    } else if depth < config.low_watermark && lanes > config.min_lanes {
        Some((
            (lanes / 2).max(config.min_lanes),
            (drains / 2).max(config.min_drain_loops),
        ))
    } else {
        None
    }
}

fn take_batch(inner: &Inner, limit: usize) -> Vec<QueuedOperation> {
    let mut queue = match inner.queue.lock() {
        Ok(queue) => queue,
        Err(poisoned) => poisoned.into_inner(),
    };
    let count = queue.len().min(limit);
    let mut batch = Vec::with_capacity(count);
    for _ in 0..count {
        if let Some(queued) = queue.pop_front() {
            inner.depth.fetch_sub(1, Ordering::SeqCst);
            batch.push(queued);
        }
    }
    batch
}

fn execute(inner: &Inner, queued: QueuedOperation, inline: bool) {
    if inline {
        inner.caller_runs.fetch_add(1, Ordering::Relaxed);
    }
    let result = (queued.op)();
    match &result {
        Ok(()) => {
            inner.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(error) => {
            inner.failed.fetch_add(1, Ordering::Relaxed);
            debug!(%error, "operation failed");
        }
    }
    // The submitter may have dropped its handle; that is not an error.
    let _ = queued.done.send(result);
}

fn spawn_generation(inner: Arc<Inner>, lanes: usize, drains: usize) -> Generation {
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut lane_txs = Vec::with_capacity(lanes);
    let mut lane_handles = Vec::with_capacity(lanes);
    for _ in 0..lanes {
        let (tx, rx) = mpsc::channel::<QueuedOperation>(inner.config.lane_buffer);
        lane_txs.push(tx);
        lane_handles.push(tokio::spawn(lane_loop(inner.clone(), rx)));
    }

    let mut drain_handles = Vec::with_capacity(drains);
    for _ in 0..drains {
        drain_handles.push(tokio::spawn(drain_loop(
            inner.clone(),
            lane_txs.clone(),
            stop_rx.clone(),
        )));
    }

    inner.lanes.store(lanes, Ordering::SeqCst);
    inner.drain_loops.store(drains, Ordering::SeqCst);

    Generation {
        lane_txs,
        lane_handles,
        drain_handles,
        stop_tx,
    }
}

/// Stop drain loops first, then let lanes run down their backlog.
async fn retire_generation(generation: Generation) {
    let _ = generation.stop_tx.send(true);
    for handle in generation.drain_handles {
        let _ = handle.await;
    }
    drop(generation.lane_txs);
    for handle in generation.lane_handles {
        let _ = handle.await;
    }
}

/// Serial lane: executes routed operations in arrival order.
async fn lane_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<QueuedOperation>) {
    while let Some(queued) = rx.recv().await {
        execute(&inner, queued, false);
    }
}

/// Drain loop: on each tick, move an adaptive batch from the staging
/// queue into lanes by key hash. Routing happens under the queue lock
/// so same-key operations reach their lane in submission order; lane
/// overflow falls back to inline execution after the lock is released.
async fn drain_loop(
    inner: Arc<Inner>,
    lane_txs: Vec<mpsc::Sender<QueuedOperation>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(inner.config.drain_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            // Fires on the stop signal or when the generation is
            // dropped; either way this loop is done.
            _ = stop_rx.changed() => {
                return;
            }
        }

        let depth = inner.depth.load(Ordering::SeqCst);
        if depth == 0 {
            continue;
        }
        let batch_size = adaptive_batch_size(depth, inner.config.base_batch_size);

        let mut overflow = Vec::new();
        {
            let mut queue = match inner.queue.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            for _ in 0..batch_size {
                let Some(queued) = queue.pop_front() else {
                    break;
                };
                inner.depth.fetch_sub(1, Ordering::SeqCst);
                let lane = (queued.key_hash % lane_txs.len() as u64) as usize;
                match lane_txs[lane].try_send(queued) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(queued))
                    | Err(mpsc::error::TrySendError::Closed(queued)) => {
                        overflow.push(queued);
                    }
                }
            }
        }

        // Saturation valve: the drain task runs overflow itself rather
        // than dropping it or blocking the queue.
        for queued in overflow {
            execute(&inner, queued, true);
        }
    }
}

/// Samples queue depth and resizes the generation on watermark
/// crossings, subject to the scale cooldown.
async fn monitor_loop(inner: Arc<Inner>, executor: AdaptiveBatchExecutor) {
    let mut tick = tokio::time::interval(inner.config.monitor_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_scale = Instant::now();
    loop {
        tick.tick().await;

        let depth = inner.depth.load(Ordering::SeqCst);
        let lanes = inner.lanes.load(Ordering::SeqCst);
        let drains = inner.drain_loops.load(Ordering::SeqCst);
        debug!(depth, lanes, drain_loops = drains, "executor monitor sample");

        if last_scale.elapsed() < inner.config.scale_cooldown {
            continue;
        }
        if let Some((new_lanes, new_drains)) = scale_decision(depth, lanes, drains, &inner.config)
        {
            if depth > inner.config.high_watermark {
                warn!(
                    depth,
                    lanes = new_lanes,
                    drain_loops = new_drains,
                    "queue depth over high watermark, growing executor"
                );
            }
            executor.resize(new_lanes, new_drains).await;
            last_scale = Instant::now();
        }
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use common::WorkId;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::time::Instant;

use crate::dispatcher::JobDispatcher;
use crate::error::{DispatchError, Result};
use crate::handler::HandlerRegistry;
use crate::job::{CompletionSignal, CompletionTarget, EnqueueOptions, JobSpec, WorkloadClass};

/// Parallelism ceiling and infra-level retry count for one pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Maximum jobs of this class running at once.
    pub parallelism: usize,

    /// Extra attempts after the first failure before the completion target
    /// gets a `failed` signal.
    pub infra_retries: u32,
}

impl PoolConfig {
    /// Creates a pool config.
    pub fn new(parallelism: usize, infra_retries: u32) -> Self {
        Self {
            parallelism,
            infra_retries,
        }
    }
}

/// Per-class pool configuration.
///
/// Each class gets its own ceiling so a backlog in one class cannot starve
/// another; rebuild work is capped below live-path classes.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub occ_retry: PoolConfig,
    pub projection: PoolConfig,
    pub integration: PoolConfig,
    pub durable_append: PoolConfig,
    pub saga_step: PoolConfig,
    pub rebuild: PoolConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            occ_retry: PoolConfig::new(4, 2),
            projection: PoolConfig::new(8, 2),
            integration: PoolConfig::new(8, 2),
            durable_append: PoolConfig::new(8, 2),
            saga_step: PoolConfig::new(4, 2),
            rebuild: PoolConfig::new(2, 1),
        }
    }
}

impl DispatcherConfig {
    fn pool(&self, class: WorkloadClass) -> PoolConfig {
        match class {
            WorkloadClass::OccRetry => self.occ_retry,
            WorkloadClass::Projection => self.projection,
            WorkloadClass::Integration => self.integration,
            WorkloadClass::DurableAppend => self.durable_append,
            WorkloadClass::SagaStep => self.saga_step,
            WorkloadClass::Rebuild => self.rebuild,
        }
    }
}

struct QueuedJob {
    work_id: WorkId,
    job: JobSpec,
    class: WorkloadClass,
    on_complete: Option<CompletionTarget>,
    not_before: Instant,
}

/// Tracks in-flight work so tests can wait for quiescence.
#[derive(Default)]
struct Inflight {
    count: Mutex<usize>,
    notify: Notify,
}

impl Inflight {
    fn start(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.notify.notify_waiters();
        }
    }

    async fn drained(&self) {
        loop {
            let notified = self.notify.notified();
            if *self.count.lock().unwrap() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// In-process dispatcher backed by tokio tasks.
///
/// Partitioned jobs are routed to one mpsc-fed lane task per partition key
/// (strict FIFO, never concurrent within a lane); unpartitioned jobs run
/// as free tasks. Both paths acquire the class semaphore so the per-class
/// parallelism ceiling holds across lanes.
#[derive(Clone)]
pub struct LocalDispatcher {
    registry: Arc<RwLock<HandlerRegistry>>,
    config: DispatcherConfig,
    semaphores: Arc<HashMap<WorkloadClass, Arc<Semaphore>>>,
    lanes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<QueuedJob>>>>,
    inflight: Arc<Inflight>,
}

impl LocalDispatcher {
    /// Creates a dispatcher over the given handler registry. The registry
    /// is shared behind a lock so that handlers whose construction needs
    /// the dispatcher (the command-execution job, saga workflows) can be
    /// registered after it.
    pub fn new(registry: Arc<RwLock<HandlerRegistry>>, config: DispatcherConfig) -> Self {
        let classes = [
            WorkloadClass::OccRetry,
            WorkloadClass::Projection,
            WorkloadClass::Integration,
            WorkloadClass::DurableAppend,
            WorkloadClass::SagaStep,
            WorkloadClass::Rebuild,
        ];
        let semaphores = classes
            .into_iter()
            .map(|class| (class, Arc::new(Semaphore::new(config.pool(class).parallelism))))
            .collect();

        Self {
            registry,
            config,
            semaphores: Arc::new(semaphores),
            lanes: Arc::new(Mutex::new(HashMap::new())),
            inflight: Arc::new(Inflight::default()),
        }
    }

    /// Waits until every queued and running job has finished. Work
    /// enqueued by running jobs is waited for as well.
    pub async fn drain(&self) {
        self.inflight.drained().await;
    }

    fn lane_sender(&self, partition_key: &str) -> mpsc::UnboundedSender<QueuedJob> {
        let mut lanes = self.lanes.lock().unwrap();
        if let Some(sender) = lanes.get(partition_key) {
            return sender.clone();
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedJob>();
        let dispatcher = self.clone();
        let key = partition_key.to_string();
        tokio::spawn(async move {
            // One job at a time per lane: strict FIFO in submission order.
            while let Some(queued) = rx.recv().await {
                dispatcher.run_queued(queued).await;
            }
            tracing::debug!(partition_key = %key, "lane closed");
        });

        lanes.insert(partition_key.to_string(), tx.clone());
        tx
    }

    async fn run_queued(&self, queued: QueuedJob) {
        tokio::time::sleep_until(queued.not_before).await;

        let semaphore = Arc::clone(&self.semaphores[&queued.class]);
        // The semaphore is never closed while the dispatcher lives.
        let _permit = semaphore.acquire_owned().await.expect("pool semaphore closed");

        let pool = self.config.pool(queued.class);
        let signal = self.run_with_retries(&queued.job, pool.infra_retries).await;

        if let Some(target) = queued.on_complete {
            let handler = self.registry.read().unwrap().completion(&target.handler_id);
            match handler {
                Some(handler) => handler.on_complete(signal, target.context).await,
                None => tracing::warn!(
                    handler_id = %target.handler_id,
                    work_id = %queued.work_id,
                    "completion handler not registered, signal dropped"
                ),
            }
        }

        self.inflight.finish();
    }

    async fn run_with_retries(&self, job: &JobSpec, infra_retries: u32) -> CompletionSignal {
        let handler = self.registry.read().unwrap().job(&job.handler_id);
        let Some(handler) = handler else {
            metrics::counter!("dispatch_unknown_handler_total").increment(1);
            return CompletionSignal::Failed {
                error: format!("unknown handler: {}", job.handler_id),
                attempts: 0,
            };
        };

        let max_attempts = infra_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match handler.run(job.args.clone()).await {
                Ok(return_value) => {
                    metrics::counter!("dispatch_jobs_completed_total").increment(1);
                    return CompletionSignal::Success { return_value };
                }
                Err(e) => {
                    tracing::warn!(
                        handler_id = %job.handler_id,
                        attempt,
                        error = %e,
                        "job attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        metrics::counter!("dispatch_jobs_failed_total").increment(1);
        CompletionSignal::Failed {
            error: last_error,
            attempts: max_attempts,
        }
    }
}

#[async_trait]
impl JobDispatcher for LocalDispatcher {
    async fn enqueue(&self, job: JobSpec, options: EnqueueOptions) -> Result<WorkId> {
        let work_id = WorkId::new();
        let not_before = Instant::now() + options.delay.unwrap_or(Duration::ZERO);
        let queued = QueuedJob {
            work_id,
            job,
            class: options.class,
            on_complete: options.on_complete,
            not_before,
        };

        self.inflight.start();
        metrics::counter!("dispatch_jobs_enqueued_total").increment(1);

        match options.partition_key {
            Some(key) => {
                let sender = self.lane_sender(&key);
                sender.send(queued).map_err(|_| {
                    self.inflight.finish();
                    DispatchError::Closed(format!("lane {key} closed"))
                })?;
            }
            None => {
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    dispatcher.run_queued(queued).await;
                });
            }
        }

        Ok(work_id)
    }
}

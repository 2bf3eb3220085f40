//! Daemon lifecycle: wire the backend, start the role's services, drain on
//! shutdown

use crate::backend::open_backend;
use crate::config::{Backend, DaemonConfig};
use crate::processors::ProcessorRegistry;
use anyhow::{Context, Result};
use cairn_core::application::recovery::DEFAULT_RECOVERY_INTERVAL;
use cairn_core::application::{
    shutdown_channel, BrokerQueue, DatabaseQueue, DomainRateLimiter, GovernorConfig, LazyQueue,
    QueueAdapter, QueueCore, RecoveryService, RecurringScheduler, ShutdownSender, ShutdownToken,
    Wakeup, Worker,
};
use cairn_core::port::{
    BroadcastPublisher, EventPublisher, IdProvider, JobStore, RecurringTaskStore,
    SystemTimeProvider, TimeProvider, UuidProvider,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const GOVERNOR_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const EVENT_BUS_CAPACITY: usize = 1024;

/// A running daemon
pub struct Daemon {
    queue: Arc<LazyQueue>,
    events: Arc<BroadcastPublisher>,
    jobs: Arc<dyn JobStore>,
    tasks: Arc<dyn RecurringTaskStore>,
    shutdown_tx: ShutdownSender,
    handles: Vec<JoinHandle<()>>,
    workers: usize,
}

impl Daemon {
    /// Open the backend and start the services of `config.role`.
    ///
    /// Workers are started for every configured queue that has a processor
    /// in `registry`.
    pub async fn start(config: DaemonConfig, registry: ProcessorRegistry) -> Result<Self> {
        let time: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        let ids: Arc<dyn IdProvider> = Arc::new(UuidProvider);
        let events = Arc::new(BroadcastPublisher::new(EVENT_BUS_CAPACITY));
        let stores = open_backend(&config, Arc::clone(&time)).await?;

        // Queue adapter, built on first use
        let wakeup = Arc::new(match &stores.remote {
            Some(remote) => Wakeup::with_remote(Arc::clone(remote)),
            None => Wakeup::local(),
        });
        let queue = {
            let backend = config.backend;
            let lease_ms = config.lease_ms;
            let jobs = Arc::clone(&stores.jobs);
            let wakeup = Arc::clone(&wakeup);
            let time = Arc::clone(&time);
            let publisher: Arc<dyn EventPublisher> = events.clone();
            Arc::new(LazyQueue::new(move || {
                let core = QueueCore::new(
                    Arc::clone(&jobs),
                    Arc::clone(&publisher),
                    Arc::clone(&time),
                    Arc::clone(&ids),
                )
                .with_lease_ms(lease_ms);
                let wakeup = Arc::clone(&wakeup);
                async move {
                    Ok(match backend {
                        Backend::Redis => QueueAdapter::Broker(BrokerQueue::new(core, wakeup)),
                        Backend::Postgres | Backend::Sqlite => {
                            QueueAdapter::Database(DatabaseQueue::new(core, wakeup))
                        }
                    })
                }
            }))
        };

        let (shutdown_tx, shutdown) = shutdown_channel();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        if let Some(bridge) = wakeup.spawn_bridge(config.queues.clone(), shutdown.clone()) {
            handles.push(bridge);
        }

        let mut workers = 0;
        if config.role.runs_workers() {
            let adapter = queue.get().await.context("queue initialization failed")?;
            let services =
                spawn_worker_services(&config, adapter, &registry, Arc::clone(&time), &shutdown);
            workers = services.workers;
            handles.extend(services.handles);
        }

        if config.role.runs_scheduler() {
            let scheduler = RecurringScheduler::new(
                Arc::clone(&stores.tasks),
                Arc::clone(&queue),
                Arc::clone(&time),
            )
            .with_interval(config.recurring_interval);
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move { scheduler.run(token).await }));
        }

        Ok(Self {
            queue,
            events,
            jobs: stores.jobs,
            tasks: stores.tasks,
            shutdown_tx,
            handles,
            workers,
        })
    }

    /// Queue handle for enqueueing and operator actions
    pub fn queue(&self) -> &Arc<LazyQueue> {
        &self.queue
    }

    /// In-process job event bus
    pub fn events(&self) -> &Arc<BroadcastPublisher> {
        &self.events
    }

    pub fn tasks(&self) -> &Arc<dyn RecurringTaskStore> {
        &self.tasks
    }

    /// Number of worker tasks started
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Signal every service, wait up to the grace period, then close the store
    pub async fn shutdown(self) {
        self.shutdown_tx.shutdown();

        let drain = futures::future::join_all(self.handles);
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Services did not stop in time");
        }
        if self.queue.is_initialized() {
            self.queue.close().await;
        } else {
            self.jobs.close().await;
        }
        info!("Shutdown complete");
    }
}

/// Run until Ctrl+C. Entry point for applications embedding the daemon with
/// their own processors.
pub async fn run(config: DaemonConfig, registry: ProcessorRegistry) -> Result<()> {
    run_until(config, registry, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
    })
    .await
}

/// Run until `signal` resolves
pub async fn run_until(
    config: DaemonConfig,
    registry: ProcessorRegistry,
    signal: impl Future<Output = ()>,
) -> Result<()> {
    let daemon = Daemon::start(config, registry).await?;
    info!(workers = daemon.worker_count(), "System ready. Press Ctrl+C to shutdown");

    signal.await;
    info!("Shutdown signal received");
    daemon.shutdown().await;
    Ok(())
}

struct WorkerServices {
    handles: Vec<JoinHandle<()>>,
    workers: usize,
}

/// Workers for every configured queue with a processor, plus lease recovery
/// and the governor sweeper
fn spawn_worker_services(
    config: &DaemonConfig,
    adapter: Arc<QueueAdapter>,
    registry: &ProcessorRegistry,
    time: Arc<dyn TimeProvider>,
    shutdown: &ShutdownToken,
) -> WorkerServices {
    let mut handles = Vec::new();
    let governor = Arc::new(DomainRateLimiter::new(GovernorConfig::default(), time));
    let recovery = Arc::new(RecoveryService::new(
        Arc::clone(adapter.store()),
        Arc::clone(adapter.tracker()),
    ));

    {
        let recovery = Arc::clone(&recovery);
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            recovery.run(DEFAULT_RECOVERY_INTERVAL, token).await
        }));
    }
    handles.push(tokio::spawn(Arc::clone(&governor).run_sweeper(
        GOVERNOR_SWEEP_INTERVAL,
        recovery.stale_callback(),
        shutdown.clone(),
    )));

    if registry.is_empty() {
        warn!("No job processors registered; workers will not be started");
        return WorkerServices {
            handles,
            workers: 0,
        };
    }
    for queue in registry.missing(&config.queues) {
        warn!(queue, "No processor registered for queue");
    }

    let process_id = std::process::id();
    let mut workers = 0;
    for queue in &config.queues {
        let Some(processor) = registry.get(queue) else {
            continue;
        };
        for n in 0..config.workers_per_queue {
            let worker = Worker::new(
                format!("{}-{}-{}", process_id, queue, n),
                queue.clone(),
                Arc::clone(&adapter),
                Arc::clone(&processor),
            )
            .with_governor(Arc::clone(&governor));
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(token).await {
                    error!(worker_id = %worker.worker_id(), error = %e, "Worker failed");
                }
            }));
            workers += 1;
        }
        info!(queue = %queue, workers = config.workers_per_queue, "Workers started");
    }
    WorkerServices { handles, workers }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::application::EnqueueRequest;
    use cairn_core::domain::JobStatus;
    use cairn_core::port::job_processor::mocks::MockProcessor;

    fn sqlite_config(dir: &tempfile::TempDir, queues: &[&str]) -> DaemonConfig {
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let queues = queues.join(",");
        DaemonConfig::from_lookup(|key| match key {
            "CAIRN_DATABASE_URL" => Some(url.clone()),
            "CAIRN_QUEUES" => Some(queues.clone()),
            "CAIRN_WORKERS_PER_QUEUE" => Some("2".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_registered_processor_gets_workers_and_completes_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let config = sqlite_config(&dir, &["note-processing", "photo-processing"]);
        let registry = ProcessorRegistry::new().register(
            "note-processing",
            Arc::new(MockProcessor::new_success().with_stages(&["embed"])),
        );

        let daemon = Daemon::start(config, registry).await.unwrap();
        assert_eq!(daemon.worker_count(), 2, "only the queue with a processor");

        let queue = daemon.queue().get().await.unwrap();
        let handle = queue
            .enqueue(EnqueueRequest::new(
                "note-processing",
                "notes:n1",
                "n1",
                "u1",
                serde_json::json!({ "noteId": "n1" }),
            ))
            .await
            .unwrap();

        let mut status = None;
        for _ in 0..100 {
            let job = queue.find(&handle.id).await.unwrap().unwrap();
            if job.status == JobStatus::Completed {
                status = Some(job.status);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(status, Some(JobStatus::Completed));

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_registry_starts_no_workers() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon::start(sqlite_config(&dir, &["note-processing"]), ProcessorRegistry::new())
            .await
            .unwrap();
        assert_eq!(daemon.worker_count(), 0);
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_until_returns_after_signal() {
        let dir = tempfile::tempdir().unwrap();
        let config = sqlite_config(&dir, &["note-processing"]);
        let registry =
            ProcessorRegistry::new().register("note-processing", Arc::new(MockProcessor::new_success()));
        run_until(config, registry, async {}).await.unwrap();
    }
}

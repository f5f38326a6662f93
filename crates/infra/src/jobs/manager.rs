//! Process-wide registry of per-owner worker infrastructure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cropwatch_core::{OwnerId, PoolId};

use super::events::{JobEventSink, TracingJobEventSink};
use super::handler::HandlerRegistry;
use super::lock;
use super::pool::{PoolState, WorkerPool};
use super::scheduler::{Scheduler, SchedulerSettings, SubmitError};
use super::types::{Job, RetryPolicy};

/// Worker manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Concurrent executions per owner
    pub pool_capacity: usize,
    /// Upper bound on a single handler execution
    pub handler_timeout: Duration,
    /// How often each scheduler scans for due jobs
    pub tick: Duration,
    /// Recurrence period of recurring jobs
    pub period: Duration,
    /// Backoff between failed attempts of a job
    pub backoff: RetryPolicy,
    /// Executions per pool per UTC day; `None` is unlimited
    pub daily_quota: Option<u32>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 5,
            handler_timeout: Duration::from_secs(30 * 60),
            tick: Duration::from_secs(5),
            period: Duration::from_secs(24 * 60 * 60),
            backoff: RetryPolicy::default(),
            daily_quota: None,
        }
    }
}

impl ManagerConfig {
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_daily_quota(mut self, limit: u32) -> Self {
        self.daily_quota = Some(limit);
        self
    }

    fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            tick: self.tick,
            period: self.period,
            backoff: self.backoff.clone(),
        }
    }
}

/// Lifecycle and routing errors.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("unknown worker pool {0}")]
    UnknownPool(PoolId),
    #[error("no worker infrastructure for owner {0}")]
    InfrastructureNotFound(OwnerId),
    #[error("worker pool {0} is already started")]
    AlreadyStarted(PoolId),
    #[error("worker pool {0} is already stopped")]
    AlreadyStopped(PoolId),
    #[error("worker manager is shut down")]
    ShutDown,
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

#[derive(Clone)]
struct Infrastructure {
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
}

#[derive(Default)]
struct Registry {
    by_owner: HashMap<OwnerId, Infrastructure>,
    by_pool: HashMap<PoolId, OwnerId>,
}

impl Registry {
    fn by_pool(&self, pool_id: PoolId) -> Option<Infrastructure> {
        self.by_pool
            .get(&pool_id)
            .and_then(|owner| self.by_owner.get(owner))
            .cloned()
    }
}

/// Creates, starts and stops the `(pool, scheduler)` pair of each owner and
/// routes job submissions to it.
///
/// The registry lock guards only the owner/pool maps and is never held across
/// an await or a handler execution; callers get `Arc` handles back.
pub struct WorkerManager {
    config: ManagerConfig,
    handlers: Arc<HandlerRegistry>,
    sink: Arc<dyn JobEventSink>,
    registry: Mutex<Registry>,
    cancel: CancellationToken,
}

impl WorkerManager {
    pub fn new(handlers: HandlerRegistry, config: ManagerConfig) -> Self {
        Self {
            config,
            handlers: Arc::new(handlers),
            sink: Arc::new(TracingJobEventSink),
            registry: Mutex::new(Registry::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the event sink used by schedulers created from now on.
    pub fn with_event_sink(mut self, sink: Arc<dyn JobEventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Allocate a pool and scheduler for `owner_id`, leaving the pool `Created`.
    ///
    /// Idempotent: an owner that already has infrastructure gets its existing
    /// pool id back.
    pub fn create_infrastructure(&self, owner_id: OwnerId) -> Result<PoolId, ManagerError> {
        if self.cancel.is_cancelled() {
            return Err(ManagerError::ShutDown);
        }

        let mut registry = lock(&self.registry);
        if let Some(existing) = registry.by_owner.get(&owner_id) {
            let pool_id = existing.pool.id();
            info!(owner = %owner_id, pool = %pool_id, "worker infrastructure already exists");
            return Ok(pool_id);
        }

        let pool = Arc::new(
            WorkerPool::new(
                owner_id,
                self.config.pool_capacity,
                self.config.handler_timeout,
                self.handlers.clone(),
            )
            .with_daily_quota(self.config.daily_quota),
        );
        let scheduler = Arc::new(Scheduler::new(
            pool.clone(),
            self.config.scheduler_settings(),
            self.sink.clone(),
            self.cancel.child_token(),
        ));
        let pool_id = pool.id();

        registry.by_pool.insert(pool_id, owner_id);
        registry.by_owner.insert(owner_id, Infrastructure { pool, scheduler });

        info!(
            owner = %owner_id,
            pool = %pool_id,
            capacity = self.config.pool_capacity,
            daily_quota = ?self.config.daily_quota,
            "worker infrastructure created"
        );
        Ok(pool_id)
    }

    /// `Created -> Started` and spawn the scheduler loop.
    pub fn start_infrastructure(&self, pool_id: PoolId) -> Result<(), ManagerError> {
        if self.cancel.is_cancelled() {
            return Err(ManagerError::ShutDown);
        }
        let infra = self.infrastructure(pool_id)?;

        infra.pool.mark_started().map_err(|state| match state {
            PoolState::Stopped => ManagerError::AlreadyStopped(pool_id),
            _ => ManagerError::AlreadyStarted(pool_id),
        })?;
        infra.scheduler.start();

        info!(owner = %infra.pool.owner_id(), pool = %pool_id, "worker infrastructure started");
        Ok(())
    }

    /// Scheduler of `owner_id`, if infrastructure was created for it.
    pub fn get_scheduler(&self, owner_id: OwnerId) -> Option<Arc<Scheduler>> {
        lock(&self.registry)
            .by_owner
            .get(&owner_id)
            .map(|infra| infra.scheduler.clone())
    }

    pub fn pool(&self, pool_id: PoolId) -> Option<Arc<WorkerPool>> {
        lock(&self.registry).by_pool(pool_id).map(|infra| infra.pool)
    }

    /// Owners that currently have infrastructure.
    pub fn owners(&self) -> Vec<OwnerId> {
        lock(&self.registry).by_owner.keys().copied().collect()
    }

    /// Route a job to the owner's scheduler. Returns its first due time.
    ///
    /// Infrastructure is never created on demand here.
    pub fn submit_job(&self, owner_id: OwnerId, job: Job) -> Result<DateTime<Utc>, ManagerError> {
        let Some(scheduler) = self.get_scheduler(owner_id) else {
            error!(owner = %owner_id, job_id = %job.id, "no scheduler for owner, job not submitted");
            return Err(ManagerError::InfrastructureNotFound(owner_id));
        };
        Ok(scheduler.submit(job)?)
    }

    /// Halt the scheduler loop, drain in-flight executions, then mark the pool `Stopped`.
    ///
    /// A `Created` pool may be stopped directly.
    pub async fn stop_infrastructure(&self, pool_id: PoolId) -> Result<(), ManagerError> {
        let infra = self.infrastructure(pool_id)?;
        if infra.pool.state() == PoolState::Stopped || infra.scheduler.is_stopped() {
            return Err(ManagerError::AlreadyStopped(pool_id));
        }
        Self::stop(&infra).await;
        Ok(())
    }

    /// Stop if needed, then forget the owner so infrastructure can be created again.
    pub async fn archive_infrastructure(&self, pool_id: PoolId) -> Result<(), ManagerError> {
        let infra = self.infrastructure(pool_id)?;
        if infra.pool.state() != PoolState::Stopped {
            Self::stop(&infra).await;
        }

        let owner_id = infra.pool.owner_id();
        let mut registry = lock(&self.registry);
        registry.by_pool.remove(&pool_id);
        if registry
            .by_owner
            .get(&owner_id)
            .is_some_and(|current| current.pool.id() == pool_id)
        {
            registry.by_owner.remove(&owner_id);
        }
        info!(owner = %owner_id, pool = %pool_id, "worker infrastructure archived");
        Ok(())
    }

    /// Stop every pool and refuse further lifecycle calls.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let all: Vec<Infrastructure> = lock(&self.registry).by_owner.values().cloned().collect();
        info!(pools = all.len(), "shutting down worker manager");

        for infra in &all {
            if infra.pool.state() != PoolState::Stopped {
                Self::stop(infra).await;
            }
        }
        info!("worker manager shut down");
    }

    fn infrastructure(&self, pool_id: PoolId) -> Result<Infrastructure, ManagerError> {
        lock(&self.registry).by_pool(pool_id).ok_or_else(|| {
            warn!(pool = %pool_id, "unknown worker pool");
            ManagerError::UnknownPool(pool_id)
        })
    }

    async fn stop(infra: &Infrastructure) {
        let pool = &infra.pool;
        info!(owner = %pool.owner_id(), pool = %pool.id(), running = pool.running(), "stopping worker infrastructure");
        infra.scheduler.stop().await;
        pool.drain().await;
        info!(owner = %pool.owner_id(), pool = %pool.id(), "worker infrastructure stopped");
    }
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .field("owners", &lock(&self.registry).by_owner.len())
            .field("shut_down", &self.cancel.is_cancelled())
            .finish()
    }
}

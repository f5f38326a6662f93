//! Bounded worker pool: at most `capacity` handler executions at a time per owner.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::task::{AbortOnDropHandle, TaskTracker};
use tracing::{debug, error, warn};

use cropwatch_core::{OwnerId, PoolId};

use super::handler::{HandlerError, HandlerRegistry};
use super::lock;
use super::types::JobParams;

/// Lifecycle state of a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Created,
    Started,
    Stopped,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PoolState::Created => "created",
            PoolState::Started => "started",
            PoolState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Why a single execution did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// No handler for the job type. A programming error, never retried.
    #[error("no handler registered for job type {0:?}")]
    UnknownJobType(String),
    /// The pool stopped before a slot became available.
    #[error("worker pool is stopped")]
    PoolStopped,
    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),
    #[error("handler panicked: {0}")]
    Panicked(String),
    /// The pool's daily execution quota is spent. The handler did not run.
    #[error("daily quota of {limit} executions reached, resets at {resets_at}")]
    QuotaExceeded { limit: u32, resets_at: DateTime<Utc> },
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Executions allowed per UTC day.
#[derive(Debug)]
struct DailyQuota {
    limit: u32,
    day: NaiveDate,
    used: u32,
}

impl DailyQuota {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            day: NaiveDate::MIN,
            used: 0,
        }
    }

    /// Count one execution on `now`'s day. Returns the reset time when the quota is spent.
    fn try_take(&mut self, now: DateTime<Utc>) -> Result<(), DateTime<Utc>> {
        let today = now.date_naive();
        if today != self.day {
            self.day = today;
            self.used = 0;
        }
        if self.used >= self.limit {
            return Err(next_midnight(now));
        }
        self.used += 1;
        Ok(())
    }
}

fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Execution slots belonging to exactly one owning entity.
///
/// The pool owns no jobs. Its scheduler hands it work through [`WorkerPool::spawn`]
/// and each spawned task calls [`WorkerPool::execute`], which waits for a free
/// slot before running the registered handler.
pub struct WorkerPool {
    id: PoolId,
    owner_id: OwnerId,
    capacity: usize,
    handler_timeout: Duration,
    handlers: Arc<HandlerRegistry>,
    slots: Semaphore,
    accepting: AtomicBool,
    running: AtomicUsize,
    state: Mutex<PoolState>,
    quota: Option<Mutex<DailyQuota>>,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(
        owner_id: OwnerId,
        capacity: usize,
        handler_timeout: Duration,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            id: PoolId::new(),
            owner_id,
            capacity,
            handler_timeout,
            handlers,
            slots: Semaphore::new(capacity),
            accepting: AtomicBool::new(true),
            running: AtomicUsize::new(0),
            state: Mutex::new(PoolState::Created),
            quota: None,
            tracker: TaskTracker::new(),
        }
    }

    /// Cap executions per UTC day. `None` means unlimited.
    pub fn with_daily_quota(mut self, limit: Option<u32>) -> Self {
        self.quota = limit.map(|l| Mutex::new(DailyQuota::new(l)));
        self
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> PoolState {
        *lock(&self.state)
    }

    /// Whether a handler is registered for `job_type`.
    pub fn handles(&self, job_type: &str) -> bool {
        self.handlers.contains(job_type)
    }

    /// Handler executions currently holding a slot.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Run the handler registered for `params`' job type.
    ///
    /// Waits until a slot is free, applies the pool's handler timeout and
    /// returns the handler's error verbatim. A timed-out handler is aborted and
    /// keeps its slot until it has actually stopped.
    pub async fn execute(&self, params: &JobParams) -> Result<(), ExecutionError> {
        let job_type = params.type_name();
        let Some(handler) = self.handlers.get(job_type) else {
            error!(pool = %self.id, job_type, "no handler registered for job type");
            return Err(ExecutionError::UnknownJobType(job_type.to_string()));
        };

        if !self.accepting.load(Ordering::Acquire) {
            return Err(ExecutionError::PoolStopped);
        }
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| ExecutionError::PoolStopped)?;
        self.take_quota(job_type)?;
        let _running = RunningGuard::enter(&self.running);

        debug!(pool = %self.id, owner = %self.owner_id, job_type, "executing job");

        let params = params.clone();
        let mut task = AbortOnDropHandle::new(tokio::spawn(async move { handler.handle(params).await }));

        match tokio::time::timeout(self.handler_timeout, &mut task).await {
            Ok(Ok(result)) => result.map_err(ExecutionError::from),
            Ok(Err(join_err)) if join_err.is_panic() => {
                let msg = panic_message(join_err.into_panic());
                error!(pool = %self.id, job_type, panic = %msg, "job handler panicked");
                Err(ExecutionError::Panicked(msg))
            }
            Ok(Err(_)) => Err(ExecutionError::PoolStopped),
            Err(_) => {
                task.abort();
                let _ = (&mut task).await;
                warn!(
                    pool = %self.id,
                    job_type,
                    timeout = ?self.handler_timeout,
                    "job handler timed out"
                );
                Err(ExecutionError::TimedOut(self.handler_timeout))
            }
        }
    }

    fn take_quota(&self, job_type: &str) -> Result<(), ExecutionError> {
        let Some(quota) = &self.quota else {
            return Ok(());
        };
        let mut quota = lock(quota);
        quota.try_take(Utc::now()).map_err(|resets_at| {
            warn!(pool = %self.id, job_type, limit = quota.limit, %resets_at, "daily quota reached");
            ExecutionError::QuotaExceeded {
                limit: quota.limit,
                resets_at,
            }
        })
    }

    /// Track a dispatch task so that [`WorkerPool::drain`] waits for it.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// `Created -> Started`. Returns the current state on any other transition.
    pub(crate) fn mark_started(&self) -> Result<(), PoolState> {
        let mut state = lock(&self.state);
        match *state {
            PoolState::Created => {
                *state = PoolState::Started;
                Ok(())
            }
            other => Err(other),
        }
    }

    /// Stop accepting work, let in-flight executions finish, then mark `Stopped`.
    ///
    /// Executions still waiting for a slot fail with [`ExecutionError::PoolStopped`].
    pub(crate) async fn drain(&self) {
        self.accepting.store(false, Ordering::Release);
        self.slots.close();
        self.tracker.close();
        self.tracker.wait().await;
        *lock(&self.state) = PoolState::Stopped;
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("capacity", &self.capacity)
            .field("state", &self.state())
            .field("running", &self.running())
            .finish()
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(kind: &str) -> JobParams {
        JobParams::custom(kind, serde_json::Value::Null)
    }

    fn pool_with(registry: HandlerRegistry, capacity: usize, timeout: Duration) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(OwnerId::new(), capacity, timeout, Arc::new(registry)))
    }

    #[tokio::test]
    async fn unknown_job_type_is_a_configuration_error() {
        let pool = pool_with(HandlerRegistry::new(), 1, Duration::from_secs(1));

        let err = pool.execute(&params("missing")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownJobType(kind) if kind == "missing"));
    }

    #[tokio::test]
    async fn handler_error_is_returned_verbatim() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("boom", |_| async { Err(HandlerError::failed("upstream 503")) });
        let pool = pool_with(registry, 1, Duration::from_secs(1));

        let err = pool.execute(&params("boom")).await.unwrap_err();
        assert_eq!(err.to_string(), "upstream 503");
    }

    #[tokio::test]
    async fn stuck_handler_times_out_and_frees_slot() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("stuck", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        registry.register_fn("quick", |_| async { Ok(()) });
        let pool = pool_with(registry, 1, Duration::from_millis(20));

        let err = pool.execute(&params("stuck")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::TimedOut(_)));
        assert_eq!(pool.running(), 0);
        assert!(pool.execute(&params("quick")).await.is_ok());
    }

    #[tokio::test]
    async fn panicking_handler_becomes_failure() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("panics", |_| async {
            let state: Option<()> = None;
            state.expect("bad state");
            Ok(())
        });
        let pool = pool_with(registry, 1, Duration::from_secs(1));

        let err = pool.execute(&params("panics")).await.unwrap_err();
        match err {
            ExecutionError::Panicked(msg) => assert!(msg.contains("bad state")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_capacity() {
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut registry = HandlerRegistry::new();
        {
            let peak = peak.clone();
            let current = current.clone();
            registry.register_fn("slow", move |_| {
                let peak = peak.clone();
                let current = current.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        let pool = pool_with(registry, 2, Duration::from_secs(5));

        let p = params("slow");
        let (a, b, c, d) = tokio::join!(
            pool.execute(&p),
            pool.execute(&p),
            pool.execute(&p),
            pool.execute(&p),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok() && d.is_ok());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drain_rejects_new_work_and_marks_stopped() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("quick", |_| async { Ok(()) });
        let pool = pool_with(registry, 1, Duration::from_secs(1));
        pool.mark_started().unwrap();

        pool.drain().await;

        assert_eq!(pool.state(), PoolState::Stopped);
        assert!(matches!(
            pool.execute(&params("quick")).await,
            Err(ExecutionError::PoolStopped)
        ));
        assert_eq!(pool.mark_started(), Err(PoolState::Stopped));
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_work() {
        let finished = Arc::new(AtomicBool::new(false));
        let mut registry = HandlerRegistry::new();
        {
            let finished = finished.clone();
            registry.register_fn("slow", move |_| {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        let pool = pool_with(registry, 1, Duration::from_secs(5));
        pool.mark_started().unwrap();

        let worker = pool.clone();
        pool.spawn(async move {
            let _ = worker.execute(&params("slow")).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.drain().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    struct Live(Arc<AtomicUsize>);

    impl Drop for Live {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// A handler that sleeps far past any test timeout, counting live instances.
    fn hanging_registry(live: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        let live = live.clone();
        let peak = peak.clone();
        registry.register_fn("hang", move |_| {
            let live = live.clone();
            let peak = peak.clone();
            async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let _live = Live(live);
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(())
            }
        });
        registry
    }

    #[tokio::test]
    async fn timed_out_handlers_never_exceed_capacity() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let pool = pool_with(hanging_registry(&live, &peak), 1, Duration::from_millis(20));

        let p = params("hang");
        let results = tokio::join!(pool.execute(&p), pool.execute(&p), pool.execute(&p));

        for result in [results.0, results.1, results.2] {
            assert!(matches!(result, Err(ExecutionError::TimedOut(_))));
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test]
    async fn drain_leaves_no_timed_out_handler_running() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let pool = pool_with(hanging_registry(&live, &peak), 1, Duration::from_millis(20));
        pool.mark_started().unwrap();

        let worker = pool.clone();
        pool.spawn(async move {
            let _ = worker.execute(&params("hang")).await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        pool.drain().await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn daily_quota_rejects_excess_executions() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("quick", |_| async { Ok(()) });
        let pool = Arc::new(
            WorkerPool::new(OwnerId::new(), 1, Duration::from_secs(1), Arc::new(registry))
                .with_daily_quota(Some(2)),
        );

        assert!(pool.execute(&params("quick")).await.is_ok());
        assert!(pool.execute(&params("quick")).await.is_ok());
        match pool.execute(&params("quick")).await {
            Err(ExecutionError::QuotaExceeded { limit, resets_at }) => {
                assert_eq!(limit, 2);
                assert!(resets_at > Utc::now());
                assert_eq!(resets_at.time(), chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn quota_resets_on_the_next_utc_day() {
        let day = |d: u32, h: u32| {
            NaiveDate::from_ymd_opt(2024, 6, d)
                .and_then(|d| d.and_hms_opt(h, 0, 0))
                .unwrap()
                .and_utc()
        };
        let mut quota = DailyQuota::new(1);

        assert!(quota.try_take(day(10, 8)).is_ok());
        assert_eq!(quota.try_take(day(10, 23)), Err(day(11, 0)));
        assert!(quota.try_take(day(11, 0)).is_ok());
    }
}

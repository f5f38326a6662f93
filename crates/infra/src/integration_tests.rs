//! Integration tests for the scheduling pipeline.
//!
//! Tests: WorkerManager → Scheduler → WorkerPool → JobHandler → JobEventSink
//!
//! Verifies:
//! - Pool capacity bounds concurrent executions per owner
//! - Retry accounting follows the failure/backoff/retire trace
//! - Recovery tolerates per-farm failures
//! - Stopping drains in-flight work
//! - Execution history keeps one record per attempt

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use cropwatch_core::OwnerId;

    use crate::history::{ExecutionHistory, ExecutionStatus, HistoryJobEventSink, InMemoryExecutionHistory};
    use crate::imagery::{ImageryError, ImageryFetchHandler, ImageryProvider, ImageryRequest, SatelliteImage};
    use crate::jobs::{
        FARM_IMAGERY_JOB, HandlerError, HandlerRegistry, InMemoryJobEventSink, Job, JobEvent,
        JobId, JobParams, ManagerConfig, NotifyingJobEventSink, PoolState,
        RetryPolicy, TracingJobEventSink, WorkerManager,
    };
    use crate::notify::{RecordingNotifier, RetryOutcome};
    use crate::record_store::InMemoryFarmStore;
    use crate::recovery::{RecoveryDriver, bootstrap_farm};

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> ManagerConfig {
        ManagerConfig::default()
            .with_pool_capacity(2)
            .with_tick(Duration::from_millis(10))
            .with_handler_timeout(Duration::from_secs(2))
            .with_backoff(RetryPolicy::fixed(0, Duration::from_millis(20)))
    }

    fn setup(handlers: HandlerRegistry, config: ManagerConfig) -> (Arc<WorkerManager>, Arc<InMemoryJobEventSink>) {
        let sink = Arc::new(InMemoryJobEventSink::new());
        let manager = WorkerManager::new(handlers, config).with_event_sink(sink.clone());
        (Arc::new(manager), sink)
    }

    fn custom(kind: &str) -> JobParams {
        JobParams::custom(kind, serde_json::Value::Null)
    }

    fn count(events: &[JobEvent], pred: impl Fn(&JobEvent) -> bool) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
    }

    #[tokio::test]
    async fn capacity_two_runs_third_job_after_a_slot_frees() {
        let spans: Arc<Mutex<Vec<(Instant, Instant)>>> = Arc::default();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handlers = HandlerRegistry::new();
        {
            let (spans, current, peak) = (spans.clone(), current.clone(), peak.clone());
            handlers.register_fn("imagery", move |_| {
                let (spans, current, peak) = (spans.clone(), current.clone(), peak.clone());
                async move {
                    let started = Instant::now();
                    let running = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(running, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    spans.lock().unwrap().push((started, Instant::now()));
                    Ok(())
                }
            });
        }
        let (manager, sink) = setup(handlers, config());
        let owner = OwnerId::new();
        let pool_id = manager.create_infrastructure(owner).unwrap();

        for id in ["a", "b", "c"] {
            manager
                .submit_job(owner, Job::one_time(custom("imagery")).with_id(id).run_now())
                .unwrap();
        }
        manager.start_infrastructure(pool_id).unwrap();

        assert!(
            sink.wait_until(WAIT, |events| count(events, |e| matches!(e, JobEvent::Retired { .. })) == 3)
                .await
        );
        assert_eq!(peak.load(Ordering::SeqCst), 2);

        let mut spans = spans.lock().unwrap().clone();
        spans.sort_by_key(|(start, _)| *start);
        let first_end = spans[0].1.min(spans[1].1);
        assert!(spans[2].0 >= first_end, "third job started before a slot freed");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn j1_fails_twice_then_succeeds_and_is_retired() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut handlers = HandlerRegistry::new();
        {
            let calls = calls.clone();
            handlers.register_fn("imagery", move |_| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt <= 2 {
                        Err(HandlerError::failed(format!("upstream timeout #{attempt}")))
                    } else {
                        Ok(())
                    }
                }
            });
        }
        let (manager, sink) = setup(handlers, config());
        let owner = OwnerId::new();
        let pool_id = manager.create_infrastructure(owner).unwrap();
        manager.start_infrastructure(pool_id).unwrap();

        manager
            .submit_job(
                owner,
                Job::one_time(custom("imagery")).with_id("J1").with_max_retries(2).run_now(),
            )
            .unwrap();

        assert!(
            sink.wait_until(WAIT, |events| events.iter().any(|e| matches!(e, JobEvent::Retired { .. })))
                .await
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        let trace: Vec<&'static str> = sink
            .events_for(&JobId::from("J1"))
            .iter()
            .map(|e| match e {
                JobEvent::Dispatched { .. } => "dispatch",
                JobEvent::RetryScheduled { attempt: 1, .. } => "retry(1)",
                JobEvent::RetryScheduled { attempt: 2, .. } => "retry(2)",
                JobEvent::Succeeded { next_due_at: None, .. } => "success",
                JobEvent::Retired { .. } => "retired",
                _ => "unexpected",
            })
            .collect();
        assert_eq!(
            trace,
            vec!["dispatch", "retry(1)", "dispatch", "retry(2)", "dispatch", "success", "retired"]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let scheduler = manager.get_scheduler(owner).unwrap();
        assert_eq!(scheduler.job_count(), 0);
        assert_eq!(scheduler.stats().failed, 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn execution_history_records_every_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut handlers = HandlerRegistry::new();
        {
            let calls = calls.clone();
            handlers.register_fn("imagery", move |_| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt == 1 {
                        Err(HandlerError::failed("upstream timeout"))
                    } else {
                        Ok(())
                    }
                }
            });
        }
        let history = Arc::new(InMemoryExecutionHistory::new());
        let events = Arc::new(InMemoryJobEventSink::new());
        let sink = Arc::new(HistoryJobEventSink::spawn(events.clone(), history.clone()));
        let manager = WorkerManager::new(handlers, config()).with_event_sink(sink.clone());
        let owner = OwnerId::new();
        let pool_id = manager.create_infrastructure(owner).unwrap();
        manager.start_infrastructure(pool_id).unwrap();
        manager
            .submit_job(owner, Job::one_time(custom("imagery")).with_id("H1").with_max_retries(1).run_now())
            .unwrap();

        assert!(
            events
                .wait_until(WAIT, |events| events.iter().any(|e| matches!(e, JobEvent::Retired { .. })))
                .await
        );
        manager.shutdown().await;
        sink.close().await;

        let mut rows = history.recent(owner, 10).await.unwrap();
        rows.reverse();
        let summary: Vec<_> = rows.iter().map(|r| (r.attempt, r.status)).collect();
        assert_eq!(
            summary,
            vec![(1, ExecutionStatus::Retrying), (2, ExecutionStatus::Completed)]
        );
        assert_eq!(rows[0].error.as_deref(), Some("upstream timeout"));
        assert!(rows.iter().all(|r| r.job_type == "imagery" && r.completed_at >= Some(r.started_at)));
    }

    #[tokio::test]
    async fn recovery_continues_past_a_failing_farm() {
        let store = Arc::new(InMemoryFarmStore::new());
        let farms = [OwnerId::new(), OwnerId::new(), OwnerId::new()];
        for farm in farms {
            store.insert_farm(farm, Some(vec![[30.0, -1.9], [30.1, -2.0], [30.0, -2.0]]));
        }

        let mut handlers = HandlerRegistry::new();
        handlers.register_fn(FARM_IMAGERY_JOB, |_| async { Ok(()) });
        let (manager, _) = setup(handlers, config());

        // farm #2 was stopped, so its start call fails
        let stopped = manager.create_infrastructure(farms[1]).unwrap();
        manager.stop_infrastructure(stopped).await.unwrap();

        let report = RecoveryDriver::new(manager.clone(), store)
            .run_at(today())
            .await
            .unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.fail_count(), 1);
        assert_eq!(report.failed[0].0, farms[1]);

        for farm in [farms[0], farms[2]] {
            let scheduler = manager.get_scheduler(farm).unwrap();
            let daily = JobId::canonical(farm, FARM_IMAGERY_JOB, "daily");
            assert!(scheduler.job(&daily).is_some());
            assert_eq!(manager.pool(scheduler.pool_id()).unwrap().state(), PoolState::Started);
        }
        assert_eq!(manager.get_scheduler(farms[1]).unwrap().job_count(), 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_bootstrap_does_not_duplicate_canonical_jobs() {
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn(FARM_IMAGERY_JOB, |_| async { Ok(()) });
        let (manager, _) = setup(handlers, config());
        let farm = OwnerId::new();

        let first = bootstrap_farm(&manager, farm, today()).unwrap();
        assert_eq!(first.submitted, 2);

        let again = bootstrap_farm(&manager, farm, today()).unwrap();
        assert_eq!(again.pool_id, first.pool_id);
        assert_eq!((again.submitted, again.skipped), (0, 2));
        assert_eq!(manager.owners(), vec![farm]);
        assert_eq!(manager.get_scheduler(farm).unwrap().job_count(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn second_recovery_pass_is_clean() {
        let store = Arc::new(InMemoryFarmStore::new());
        for _ in 0..2 {
            store.insert_farm(OwnerId::new(), Some(vec![[30.0, -1.9], [30.1, -2.0], [30.0, -2.0]]));
        }
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn(FARM_IMAGERY_JOB, |_| async { Ok(()) });
        let (manager, _) = setup(handlers, config());
        let driver = RecoveryDriver::new(manager.clone(), store);

        assert!(driver.run_at(today()).await.unwrap().is_clean());
        let second = driver.run_at(today()).await.unwrap();

        assert!(second.is_clean());
        assert_eq!(second.succeeded, 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn daily_quota_defers_further_runs_to_midnight() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut handlers = HandlerRegistry::new();
        {
            let calls = calls.clone();
            handlers.register_fn("daily", move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            });
        }
        let (manager, sink) = setup(
            handlers,
            config().with_period(Duration::from_millis(20)).with_daily_quota(1),
        );
        let owner = OwnerId::new();
        let pool_id = manager.create_infrastructure(owner).unwrap();
        manager.start_infrastructure(pool_id).unwrap();
        manager
            .submit_job(owner, Job::recurring(custom("daily")).with_id("d").run_now())
            .unwrap();

        assert!(
            sink.wait_until(WAIT, |events| events.iter().any(|e| matches!(e, JobEvent::Deferred { .. })))
                .await
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let job = manager.get_scheduler(owner).unwrap().job(&"d".into()).unwrap();
        assert_eq!(job.attempts(), 0);
        assert!(job.next_due_at() > chrono::Utc::now());
        assert_eq!(job.next_due_at().time(), chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_handler_and_halts_dispatch() {
        let finished = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicU32::new(0));
        let mut handlers = HandlerRegistry::new();
        {
            let (finished, calls) = (finished.clone(), calls.clone());
            handlers.register_fn("slow", move |_| {
                let finished = finished.clone();
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        let (manager, sink) = setup(handlers, config().with_period(Duration::from_millis(20)));
        let owner = OwnerId::new();
        let pool_id = manager.create_infrastructure(owner).unwrap();
        manager.start_infrastructure(pool_id).unwrap();
        manager
            .submit_job(owner, Job::recurring(custom("slow")).with_id("r").run_now())
            .unwrap();

        assert!(
            sink.wait_until(WAIT, |events| events.iter().any(|e| matches!(e, JobEvent::Dispatched { .. })))
                .await
        );
        manager.stop_infrastructure(pool_id).await.unwrap();

        assert!(finished.load(Ordering::SeqCst), "stop returned before the handler finished");
        assert_eq!(manager.pool(pool_id).unwrap().state(), PoolState::Stopped);

        let calls_at_stop = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), calls_at_stop);
    }

    #[tokio::test]
    async fn recurring_job_rearms_every_period() {
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("daily", |_| async { Ok(()) });
        let (manager, sink) = setup(handlers, config().with_period(Duration::from_millis(40)));
        let owner = OwnerId::new();
        let pool_id = manager.create_infrastructure(owner).unwrap();
        manager.start_infrastructure(pool_id).unwrap();
        manager
            .submit_job(owner, Job::recurring(custom("daily")).with_id("d").run_now())
            .unwrap();

        assert!(
            sink.wait_until(WAIT, |events| {
                count(events, |e| matches!(e, JobEvent::Succeeded { next_due_at: Some(_), .. })) >= 3
            })
            .await
        );

        let scheduler = manager.get_scheduler(owner).unwrap();
        assert!(scheduler.job(&"d".into()).is_some());
        assert_eq!(scheduler.stats().retired, 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_recurring_occurrence_is_rearmed_not_dropped() {
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("broken", |_| async { Err(HandlerError::failed("always down")) });
        let (manager, sink) = setup(handlers, config().with_period(Duration::from_millis(60)));
        let owner = OwnerId::new();
        let pool_id = manager.create_infrastructure(owner).unwrap();
        manager.start_infrastructure(pool_id).unwrap();
        manager
            .submit_job(
                owner,
                Job::recurring(custom("broken")).with_id("r").with_max_retries(1).run_now(),
            )
            .unwrap();

        assert!(
            sink.wait_until(WAIT, |events| {
                count(events, |e| matches!(e, JobEvent::OccurrenceAbandoned { attempts: 2, .. })) >= 2
            })
            .await
        );
        let events = sink.events();
        assert_eq!(count(&events, |e| matches!(e, JobEvent::Exhausted { .. })), 0);
        assert!(manager.get_scheduler(owner).unwrap().job(&"r".into()).is_some());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_job_notifies_owner() {
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("broken", |_| async { Err(HandlerError::failed("always down")) });

        let notifier = Arc::new(RecordingNotifier::failing(1));
        let sink = Arc::new(NotifyingJobEventSink::new(
            Arc::new(TracingJobEventSink),
            notifier.clone(),
            RetryPolicy::fixed(3, Duration::from_millis(5)),
        ));
        let manager = WorkerManager::new(handlers, config()).with_event_sink(sink.clone());
        let owner = OwnerId::new();
        let pool_id = manager.create_infrastructure(owner).unwrap();
        manager.start_infrastructure(pool_id).unwrap();
        manager
            .submit_job(owner, Job::one_time(custom("broken")).with_id("x").with_max_retries(0).run_now())
            .unwrap();

        let deadline = Instant::now() + WAIT;
        while notifier.sent().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.shutdown().await;

        assert_eq!(sink.flush().await, vec![RetryOutcome::Delivered { attempts: 2 }]);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, owner);
    }

    struct StaticProvider(Vec<SatelliteImage>);

    #[async_trait]
    impl ImageryProvider for StaticProvider {
        async fn fetch(&self, _: &ImageryRequest) -> Result<Vec<SatelliteImage>, ImageryError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn bootstrapped_farm_backfills_imagery() {
        let store = Arc::new(InMemoryFarmStore::new());
        let farm = OwnerId::new();
        store.insert_farm(farm, Some(vec![[30.0, -1.9], [30.1, -2.0], [30.0, -2.0]]));

        let provider = Arc::new(StaticProvider(vec![SatelliteImage {
            url: "https://imagery/2024-05-01.png".to_string(),
            acquisition_date: NaiveDate::from_ymd_opt(2024, 5, 1),
        }]));
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            FARM_IMAGERY_JOB,
            Arc::new(ImageryFetchHandler::new(provider, store.clone()).with_today(today())),
        );
        let (manager, sink) = setup(handlers, config());

        bootstrap_farm(&manager, farm, today()).unwrap();

        let backfill = JobId::canonical(farm, FARM_IMAGERY_JOB, "backfill");
        assert!(
            sink.wait_until(WAIT, |events| events
                .iter()
                .any(|e| matches!(e, JobEvent::Retired { job_id, .. } if *job_id == backfill)))
                .await
        );
        assert_eq!(store.photos(farm).len(), 1);
        assert_eq!(manager.get_scheduler(farm).unwrap().job_count(), 1);
        manager.shutdown().await;
    }
}

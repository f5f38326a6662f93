mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use cropwatch_infra::history::{ExecutionHistory, HistoryJobEventSink, InMemoryExecutionHistory};
use cropwatch_infra::imagery::{HttpImageryClient, ImageryFetchHandler};
use cropwatch_infra::jobs::{
    FARM_IMAGERY_JOB, HandlerRegistry, NotifyingJobEventSink, RetryPolicy, TracingJobEventSink,
    WorkerManager,
};
use cropwatch_infra::notify::{LogNotifier, Notifier, WebhookNotifier};
use cropwatch_infra::record_store::{FarmStore, InMemoryFarmStore};
use cropwatch_infra::recovery::RecoveryDriver;

use crate::config::{DATABASE_URL_ENV, WorkerConfig};

const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cropwatch_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let (store, history) = build_backends(&config).await?;

    let imagery = HttpImageryClient::new(&config.imagery_url, config.imagery_timeout)
        .context("failed to build imagery client")?;
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        FARM_IMAGERY_JOB,
        Arc::new(ImageryFetchHandler::new(Arc::new(imagery), store.clone())),
    );

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(
            WebhookNotifier::new(url, Duration::from_secs(10)).context("failed to build notifier")?,
        ),
        None => Arc::new(LogNotifier),
    };
    let history_sink = Arc::new(HistoryJobEventSink::spawn(Arc::new(TracingJobEventSink), history));
    let sink = Arc::new(NotifyingJobEventSink::new(
        history_sink.clone(),
        notifier,
        RetryPolicy::exponential(5, Duration::from_secs(10), Duration::from_secs(300)),
    ));
    let manager = Arc::new(WorkerManager::new(handlers, config.manager.clone()).with_event_sink(sink.clone()));

    match RecoveryDriver::new(manager.clone(), store).run().await {
        Ok(report) if report.is_clean() => {}
        Ok(report) => tracing::warn!(
            fail_count = report.fail_count(),
            total = report.total,
            "some farms have no live scheduling until the next recovery"
        ),
        Err(e) => tracing::error!(error = %e, "farm job recovery skipped"),
    }

    tracing::info!(imagery_url = %config.imagery_url, "worker running");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown signal received");
    manager.shutdown().await;

    flush_event_sinks(&sink, &history_sink, SHUTDOWN_FLUSH_TIMEOUT).await;
    Ok(())
}

/// Wait, up to `timeout` each, for queued notifications and history writes.
async fn flush_event_sinks(notifying: &NotifyingJobEventSink, history: &HistoryJobEventSink, timeout: Duration) {
    match tokio::time::timeout(timeout, notifying.flush()).await {
        Ok(outcomes) => tracing::info!(notifications = outcomes.len(), "pending notifications settled"),
        Err(_) => tracing::warn!(
            timeout_secs = timeout.as_secs(),
            "gave up waiting for pending notifications"
        ),
    }
    if tokio::time::timeout(timeout, history.close()).await.is_err() {
        tracing::warn!(timeout_secs = timeout.as_secs(), "gave up writing execution history");
    }
}

type Backends = (Arc<dyn FarmStore>, Arc<dyn ExecutionHistory>);

async fn build_backends(config: &WorkerConfig) -> anyhow::Result<Backends> {
    match &config.database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            use cropwatch_infra::history::PostgresExecutionHistory;
            use cropwatch_infra::record_store::PostgresFarmStore;

            let store = PostgresFarmStore::connect(url)
                .await
                .context("failed to connect to farm database")?;
            let history = PostgresExecutionHistory::new(store.pool().clone());
            Ok((Arc::new(store), Arc::new(history)))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!("built without postgres support; using in-memory farm store and history");
            Ok(in_memory_backends())
        }
        None => {
            tracing::warn!("{DATABASE_URL_ENV} not set; using in-memory farm store and history");
            Ok(in_memory_backends())
        }
    }
}

fn in_memory_backends() -> Backends {
    (
        Arc::new(InMemoryFarmStore::new()),
        Arc::new(InMemoryExecutionHistory::new()),
    )
}

#[cfg(test)]
mod tests {
    use cropwatch_core::OwnerId;
    use cropwatch_infra::jobs::{InMemoryJobEventSink, JobEvent, JobEventSink};

    use super::*;

    #[tokio::test]
    async fn flush_settles_notifications_and_writes_history() {
        let history = Arc::new(InMemoryExecutionHistory::new());
        let events = Arc::new(InMemoryJobEventSink::new());
        let history_sink = Arc::new(HistoryJobEventSink::spawn(events.clone(), history.clone()));
        let sink = NotifyingJobEventSink::new(history_sink.clone(), Arc::new(LogNotifier), RetryPolicy::no_retry());
        let owner = OwnerId::new();

        sink.record(JobEvent::Dispatched {
            owner_id: owner,
            job_id: "J1".into(),
            job_type: FARM_IMAGERY_JOB.to_string(),
            attempt: 1,
        });
        sink.record(JobEvent::Exhausted {
            owner_id: owner,
            job_id: "J1".into(),
            attempts: 1,
            error: "imagery service unavailable".to_string(),
        });

        flush_event_sinks(&sink, &history_sink, Duration::from_secs(5)).await;

        assert_eq!(events.events().len(), 2);
        let rows = history.recent(owner, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, cropwatch_infra::history::ExecutionStatus::Failed);

        // Closed: later events are no longer written.
        sink.record(JobEvent::Dispatched {
            owner_id: owner,
            job_id: "J2".into(),
            job_type: FARM_IMAGERY_JOB.to_string(),
            attempt: 1,
        });
        assert_eq!(history.recent(owner, 10).await.unwrap().len(), 1);
    }
}

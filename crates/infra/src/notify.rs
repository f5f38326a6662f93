//! Owner notifications and the bounded-retry task that delivers them.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use cropwatch_core::OwnerId;

use crate::jobs::RetryPolicy;

/// Outbound messaging channel used to tell an owner about state changes.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, owner_id: OwnerId, message: &str) -> anyhow::Result<()>;
}

/// Posts notifications as JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    owner_id: OwnerId,
    message: &'a str,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, owner_id: OwnerId, message: &str) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(&WebhookBody { owner_id, message })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Writes notifications to the log. Used when no channel is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, owner_id: OwnerId, message: &str) -> anyhow::Result<()> {
        info!(owner = %owner_id, message, "owner notification");
        Ok(())
    }
}

/// Final state of a bounded-retry task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Delivered { attempts: u32 },
    GaveUp { attempts: u32, last_error: String },
}

impl RetryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, RetryOutcome::Delivered { .. })
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` retries are used up.
///
/// Sleeps `policy.delay_for_attempt(n)` after the n-th failure.
pub async fn retry_bounded<F, Fut, E>(name: &str, policy: &RetryPolicy, mut op: F) -> RetryOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(()) => {
                if attempt > 1 {
                    info!(task = name, attempt, "delivered after retry");
                }
                return RetryOutcome::Delivered { attempts: attempt };
            }
            Err(e) if !policy.should_retry(attempt - 1) => {
                error!(task = name, attempts = attempt, error = %e, "giving up");
                return RetryOutcome::GaveUp {
                    attempts: attempt,
                    last_error: e.to_string(),
                };
            }
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(task = name, attempt, delay = ?delay, error = %e, "attempt failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Spawn [`retry_bounded`] as a background task.
pub fn spawn_bounded_retry<F, Fut, E>(
    name: impl Into<String>,
    policy: RetryPolicy,
    op: F,
) -> JoinHandle<RetryOutcome>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let name = name.into();
    tokio::spawn(async move { retry_bounded(&name, &policy, op).await })
}

/// Test notifier that records messages and fails the first `failures` calls.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingNotifier {
    failures: std::sync::atomic::AtomicU32,
    sent: std::sync::Mutex<Vec<(OwnerId, String)>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub(crate) fn failing(failures: u32) -> Self {
        Self {
            failures: std::sync::atomic::AtomicU32::new(failures),
            ..Self::default()
        }
    }

    pub(crate) fn sent(&self) -> Vec<(OwnerId, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, owner_id: OwnerId, message: &str) -> anyhow::Result<()> {
        use std::sync::atomic::Ordering;

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("channel unavailable");
        }
        self.sent.lock().unwrap().push((owner_id, message.to_string()));
        Ok(())
    }
}

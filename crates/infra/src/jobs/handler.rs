//! Job handler registry: maps a job type tag to the code that performs the work.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::types::JobParams;

/// Failure reported by a handler.
///
/// All variants are ordinary failures consumed by the scheduler's retry
/// accounting; handlers never signal failure by panicking.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Parameters were not the shape this handler expects.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    /// The work itself failed (typically a downstream dependency).
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Code that performs one job type.
///
/// Must be safe to re-invoke with the same parameters: retried jobs re-run
/// the full handler.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, params: JobParams) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, params: JobParams) -> Result<(), HandlerError> {
        (self.0)(params).await
    }
}

/// Job type → handler mapping, populated at startup and then read-only.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type, replacing any previous one.
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        if self.handlers.insert(job_type.clone(), handler).is_some() {
            tracing::warn!(job_type = %job_type, "replaced existing job handler");
        } else {
            tracing::info!(job_type = %job_type, "registered job handler");
        }
    }

    /// Register an async closure as the handler for a job type.
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(JobParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(job_type, Arc::new(FnHandler(handler)));
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;

use super::QueuedOperation;
use crate::error::CallError;

/// Replays one queued operation. Looked up by name at replay time.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, op: &QueuedOperation) -> Result<(), CallError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(QueuedOperation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CallError>> + Send + 'static,
{
    async fn handle(&self, op: &QueuedOperation) -> Result<(), CallError> {
        (self.0)(op.clone()).await
    }
}

/// Name → handler map shared by every queue replaying through it.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(QueuedOperation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler(f)));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(name).map(|h| h.value().clone())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

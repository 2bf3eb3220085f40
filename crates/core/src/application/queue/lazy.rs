// Lazily initialised queue handle with a single in-flight initialisation

use super::{EnqueueRequest, JobHandle, QueueAdapter};
use crate::error::{AppError, Result};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

type InitFn = Box<dyn Fn() -> BoxFuture<'static, Result<QueueAdapter>> + Send + Sync>;

/// Queue handle that connects on first use.
///
/// Concurrent first callers share one initialisation; a failed attempt is
/// retried by the next caller.
pub struct LazyQueue {
    cell: OnceCell<Arc<QueueAdapter>>,
    init: InitFn,
}

impl LazyQueue {
    pub fn new<F, Fut>(init: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<QueueAdapter>> + Send + 'static,
    {
        Self {
            cell: OnceCell::new(),
            init: Box::new(move || Box::pin(init())),
        }
    }

    /// Wrap an already-built adapter
    pub fn ready(queue: Arc<QueueAdapter>) -> Self {
        Self {
            cell: OnceCell::new_with(Some(queue)),
            init: Box::new(|| {
                Box::pin(async { Err(AppError::Internal("queue already initialized".to_string())) })
            }),
        }
    }

    pub async fn get(&self) -> Result<Arc<QueueAdapter>> {
        let queue = self
            .cell
            .get_or_try_init(|| async {
                let queue = (self.init)().await?;
                info!(backend = queue.backend_name(), "Queue initialized");
                Ok::<_, AppError>(Arc::new(queue))
            })
            .await?;
        Ok(Arc::clone(queue))
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<JobHandle> {
        self.get().await?.enqueue(req).await
    }

    /// Close the adapter if it was ever initialised
    pub async fn close(&self) {
        if let Some(queue) = self.cell.get() {
            queue.close().await;
        }
    }
}

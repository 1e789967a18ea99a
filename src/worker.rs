//! Bounded execution of blocking dependencies.
//!
//! Jobs run on tokio's blocking thread pool, at most `size` at a time.
//! A job owns its permit, so the slot stays taken until the closure
//! returns even if the awaiting task was dropped (e.g. a deadline fired).

use log::error;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::TransformError;

pub struct BlockingPool {
    name: String,
    size: usize,
    permits: Arc<Semaphore>,
}

impl BlockingPool {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently held by a running job.
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `f` on a blocking thread once a slot is free and wait for its
    /// result. A panic inside `f` becomes [`TransformError::WorkerPanicked`].
    pub async fn run<F, T>(&self, f: F) -> Result<T, TransformError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TransformError::WorkersClosed)?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        });
        match handle.await {
            Ok(value) => Ok(value),
            Err(e) if e.is_panic() => {
                error!("{} job panicked", self.name);
                Err(TransformError::WorkerPanicked)
            }
            Err(_) => Err(TransformError::WorkersClosed),
        }
    }

    /// Stop accepting jobs. Jobs already running finish normally.
    pub fn shutdown(&self) {
        self.permits.close();
    }
}

//! Bounded pool for CPU-bound inference.
//!
//! Work runs on tokio's blocking threads; a semaphore caps how many jobs of
//! one kind run at once across all sessions, so a slow model queues work
//! here instead of stalling socket reads.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::InferenceError;

/// Named pool of at most `size` concurrent blocking jobs.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    size: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool allowing `size` concurrent jobs (minimum one).
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name,
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    /// Run `job` on a blocking thread once a slot is free.
    ///
    /// Dropping the returned future before a slot is granted cancels the
    /// job; once started, the job runs to completion and its result is
    /// discarded.
    pub async fn run<F, R>(&self, job: F) -> Result<R, InferenceError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| InferenceError::Worker {
                pool: self.name,
                message: e.to_string(),
            })?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| InferenceError::Worker {
            pool: self.name,
            message: e.to_string(),
        })
    }

    /// Pool name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Configured concurrency.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

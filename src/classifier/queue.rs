//! Bounded classification queue
//!
//! Every classifier call holds a semaphore permit. Waiting for a permit is
//! capped; a caller that times out gets `rate_limit` and nothing is recorded
//! for its turn.

use crate::config::QueueConfig;
use crate::error::{EngineError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ClassificationQueue {
    permits: Arc<Semaphore>,
    workers: usize,
    acquire_timeout: Duration,
}

impl ClassificationQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            workers: config.max_concurrent,
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Runs `task` once a worker slot is free.
    pub async fn run<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let permit = match tokio::time::timeout(self.acquire_timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(EngineError::Classifier("classification queue is closed".to_string())),
            Err(_) => {
                warn!(
                    "No classification worker free after {:?} ({} workers)",
                    self.acquire_timeout, self.workers
                );
                return Err(EngineError::RateLimited(
                    "too many questions in flight, try again shortly".to_string(),
                ));
            }
        };
        debug!(available = self.available(), "Classification slot acquired");
        let result = task.await;
        drop(permit);
        result
    }
}

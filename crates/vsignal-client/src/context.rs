// Shared runtime state of one SDK instance.
//
// The pool and config travel together behind one Arc; nothing in the
// crate reaches for process-wide state.
use std::sync::Arc;

use crate::config::SdkConfig;
use crate::pool::WorkerPool;

/// Execution context shared by every component of one client instance.
pub struct SdkContext {
    pool: WorkerPool,
    config: SdkConfig,
}

impl SdkContext {
    pub fn new(config: SdkConfig) -> Arc<Self> {
        let pool = WorkerPool::new(config.worker_threads);
        Arc::new(Self { pool, config })
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    /// Stop the worker pool; pending jobs are dropped, the in-flight one
    /// finishes.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

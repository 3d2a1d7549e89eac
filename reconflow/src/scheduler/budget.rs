//! Thread and memory budget shared by every stage of a run.

use crate::config::ResourceConfig;
use crate::errors::ReconflowError;
use crate::stages::ResourceHint;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting budget of threads and memory (in MB).
///
/// Requests larger than the budget are clamped to it, so an oversized stage
/// runs alone instead of never running.
#[derive(Debug, Clone)]
pub struct ResourceBudget {
    threads: Arc<Semaphore>,
    memory_mb: Arc<Semaphore>,
    total_threads: u32,
    total_memory_mb: u32,
}

/// Resources held by a running stage; released on drop.
#[derive(Debug)]
pub struct ResourceLease {
    threads: u32,
    memory_mb: u32,
    _permits: Vec<OwnedSemaphorePermit>,
}

impl ResourceLease {
    /// Threads held.
    #[must_use]
    pub const fn threads(&self) -> u32 {
        self.threads
    }

    /// Memory held, in MB.
    #[must_use]
    pub const fn memory_mb(&self) -> u32 {
        self.memory_mb
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn gb_to_mb(gb: f64) -> u32 {
    if gb.is_finite() && gb > 0.0 {
        (gb * 1024.0).ceil().min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

impl ResourceBudget {
    /// Creates a budget.
    #[must_use]
    pub fn new(threads: u32, mem_gb: f64) -> Self {
        let total_threads = threads.max(1);
        let total_memory_mb = gb_to_mb(mem_gb).max(1);
        Self {
            threads: Arc::new(Semaphore::new(total_threads as usize)),
            memory_mb: Arc::new(Semaphore::new(total_memory_mb as usize)),
            total_threads,
            total_memory_mb,
        }
    }

    /// Creates a budget from the run configuration.
    #[must_use]
    pub fn from_config(config: &ResourceConfig) -> Self {
        Self::new(config.nprocs, config.mem_gb)
    }

    /// Total threads.
    #[must_use]
    pub const fn total_threads(&self) -> u32 {
        self.total_threads
    }

    /// Total memory in MB.
    #[must_use]
    pub const fn total_memory_mb(&self) -> u32 {
        self.total_memory_mb
    }

    /// Threads not currently leased.
    #[must_use]
    pub fn available_threads(&self) -> usize {
        self.threads.available_permits()
    }

    /// Waits until the resources of `hint` are free and leases them.
    ///
    /// Threads are always acquired before memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the budget was closed.
    pub async fn acquire(&self, hint: &ResourceHint) -> Result<ResourceLease, ReconflowError> {
        let threads = hint.threads.min(self.total_threads);
        let memory_mb = gb_to_mb(hint.mem_gb).min(self.total_memory_mb);
        let mut permits = Vec::with_capacity(2);

        if threads > 0 {
            permits.push(
                Arc::clone(&self.threads)
                    .acquire_many_owned(threads)
                    .await
                    .map_err(|_| ReconflowError::Internal("thread budget closed".to_string()))?,
            );
        }
        if memory_mb > 0 {
            permits.push(
                Arc::clone(&self.memory_mb)
                    .acquire_many_owned(memory_mb)
                    .await
                    .map_err(|_| ReconflowError::Internal("memory budget closed".to_string()))?,
            );
        }

        Ok(ResourceLease {
            threads,
            memory_mb,
            _permits: permits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_clamps_to_budget() {
        let budget = ResourceBudget::new(4, 8.0);
        let lease = budget.acquire(&ResourceHint::new(16, 64.0)).await.unwrap();

        assert_eq!(lease.threads(), 4);
        assert_eq!(lease.memory_mb(), 8192);
        assert_eq!(budget.available_threads(), 0);
        drop(lease);
        assert_eq!(budget.available_threads(), 4);
    }

    #[tokio::test]
    async fn test_coordinator_holds_nothing() {
        let budget = ResourceBudget::new(2, 1.0);
        let lease = budget.acquire(&ResourceHint::coordinator()).await.unwrap();

        assert_eq!(lease.threads(), 0);
        assert_eq!(budget.available_threads(), 2);
    }

    #[tokio::test]
    async fn test_blocks_until_released() {
        let budget = ResourceBudget::new(2, 4.0);
        let first = budget.acquire(&ResourceHint::new(2, 1.0)).await.unwrap();

        let waiting = {
            let budget = budget.clone();
            tokio::spawn(async move { budget.acquire(&ResourceHint::new(1, 1.0)).await.map(|l| l.threads()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(first);
        assert_eq!(waiting.await.unwrap().unwrap(), 1);
    }

    #[test]
    fn test_gb_to_mb() {
        assert_eq!(gb_to_mb(0.5), 512);
        assert_eq!(gb_to_mb(-1.0), 0);
        assert_eq!(gb_to_mb(f64::NAN), 0);
    }
}

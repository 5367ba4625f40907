//! Bounded executor shared by every replica group on a node
//!
//! Commands run as tokio tasks. A semaphore caps how many are in flight;
//! a submission that finds no free permit is rejected immediately and the
//! caller backs off instead of queueing.

use crate::error::{ReplicationError, Result};
use crate::protocol::{Command, ReplicationResponse};
use crate::transport::ReplicationClient;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, TryAcquireError};

/// Semaphore-bounded task spawner
pub struct ReplicateExecutor {
    permits: Arc<Semaphore>,
    capacity: usize,
    runtime: Handle,
}

impl ReplicateExecutor {
    /// Create an executor bound to the current tokio runtime
    pub fn new(capacity: usize) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| ReplicationError::Internal(format!("no tokio runtime: {}", e)))?;
        Ok(Self::with_handle(capacity, runtime))
    }

    pub fn with_handle(capacity: usize, runtime: Handle) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            runtime,
        }
    }

    /// Run `task` if a permit is free
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(ReplicationError::ExecutorSaturated {
                    capacity: self.capacity,
                })
            }
            Err(TryAcquireError::Closed) => return Err(ReplicationError::ShuttingDown),
        };

        self.runtime.spawn(async move {
            task.await;
            drop(permit);
        });
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Commands currently running
    pub fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.permits.available_permits())
    }

    /// Reject every later submission
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Executor plus client, handed to every replica group
pub struct Dispatcher {
    executor: ReplicateExecutor,
    client: Arc<dyn ReplicationClient>,
}

impl Dispatcher {
    pub fn new(executor: ReplicateExecutor, client: Arc<dyn ReplicationClient>) -> Self {
        Self { executor, client }
    }

    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.executor.submit(task)
    }

    pub async fn send_command(
        &self,
        address: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<ReplicationResponse> {
        self.client.send_command(address, command, timeout).await
    }

    pub fn executor(&self) -> &ReplicateExecutor {
        &self.executor
    }

    pub fn client(&self) -> &Arc<dyn ReplicationClient> {
        &self.client
    }

    /// Stop accepting commands and drop pooled connections
    pub fn shutdown(&self) {
        self.executor.close();
        self.client.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_submit_runs_task() {
        let executor = ReplicateExecutor::new(2).unwrap();
        let (tx, rx) = oneshot::channel();
        executor
            .submit(async move {
                let _ = tx.send(42);
            })
            .unwrap();
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_saturated_executor_rejects() {
        let executor = ReplicateExecutor::new(1).unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        executor
            .submit(async move {
                let _ = release_rx.await;
                let _ = done_tx.send(());
            })
            .unwrap();
        assert_eq!(executor.in_flight(), 1);

        let err = executor.submit(async {}).unwrap_err();
        assert!(matches!(err, ReplicationError::ExecutorSaturated { capacity: 1 }));

        release_tx.send(()).unwrap();
        done_rx.await.unwrap();
        // permit is released right after the task body completes
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(executor.in_flight(), 0);
        executor.submit(async {}).unwrap();
    }

    #[tokio::test]
    async fn test_closed_executor_rejects() {
        let executor = ReplicateExecutor::new(4).unwrap();
        executor.close();
        let err = executor.submit(async {}).unwrap_err();
        assert!(matches!(err, ReplicationError::ShuttingDown));
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        assert!(ReplicateExecutor::new(4).is_err());
    }
}

//! Timeout-aware runner for remote pipeline operations.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::events::{BlockStreamError, PipelineOperation, TransportError};

/// Runs pipeline operations under a time budget and a shared shutdown token.
///
/// Shared by every connection of a manager; cloning is cheap.
#[derive(Clone, Debug)]
pub struct PipelineTaskRunner {
    timeout: Duration,
    shutdown: CancellationToken,
}

impl PipelineTaskRunner {
    pub fn new(timeout: Duration, shutdown: CancellationToken) -> Self {
        Self { timeout, shutdown }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Runs `operation` under the default budget.
    pub async fn run<T, F>(&self, operation: PipelineOperation, fut: F) -> Result<T, BlockStreamError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        self.run_with_timeout(operation, self.timeout, fut).await
    }

    /// Runs `operation` under `budget`. The future is dropped on timeout or
    /// shutdown.
    pub async fn run_with_timeout<T, F>(
        &self,
        operation: PipelineOperation,
        budget: Duration,
        fut: F,
    ) -> Result<T, BlockStreamError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(BlockStreamError::Cancelled),
            result = tokio::time::timeout(budget, fut) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(source)) => Err(BlockStreamError::Transport { operation, source }),
                Err(_) => Err(BlockStreamError::PipelineTimeout {
                    operation,
                    timeout: budget,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> PipelineTaskRunner {
        PipelineTaskRunner::new(Duration::from_millis(50), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_completed_operation_returns_value() {
        let result = runner()
            .run(PipelineOperation::Send, async { Ok::<_, TransportError>(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_operation_times_out() {
        let result = runner()
            .run(PipelineOperation::Close, std::future::pending::<Result<(), TransportError>>())
            .await;
        assert!(matches!(
            result,
            Err(BlockStreamError::PipelineTimeout {
                operation: PipelineOperation::Close,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_transport_error_is_wrapped() {
        let result = runner()
            .run(PipelineOperation::Send, async {
                Err::<(), _>(TransportError::StreamClosed)
            })
            .await;
        assert!(matches!(
            result,
            Err(BlockStreamError::Transport {
                source: TransportError::StreamClosed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_operation() {
        let runner = runner();
        runner.shutdown_token().cancel();
        let result = runner
            .run_with_timeout(
                PipelineOperation::Open,
                Duration::from_secs(60),
                std::future::pending::<Result<(), TransportError>>(),
            )
            .await;
        assert!(matches!(result, Err(BlockStreamError::Cancelled)));
    }
}

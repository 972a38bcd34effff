use crate::errors::PipelineError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cooperative cancellation signal shared by every suspension point of a run.
#[derive(Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as self, so wait_for only fails if it is dropped.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Run `fut` unless the token fires first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, PipelineError> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(PipelineError::Cancelled),
            output = fut => Ok(output),
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Result<(), PipelineError> {
        if duration.is_zero() {
            return if self.is_cancelled() {
                Err(PipelineError::Cancelled)
            } else {
                Ok(())
            };
        }
        self.run(tokio::time::sleep(duration)).await
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

//! Caller-initiated cancellation for in-flight executions

use crate::error::{ExecutorError, ExecutorResult};

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Held by the caller; cancels every execution holding a matching signal
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Held by the executor and its pollers
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Create a linked handle/signal pair
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        // Receivers may all be gone already
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Dropping the sender leaves the value at `false` forever
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pending forever otherwise
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `fut` unless cancellation fires first
    pub async fn guard<F, T>(&self, fut: F) -> ExecutorResult<T>
    where
        F: Future<Output = ExecutorResult<T>>,
    {
        let mut signal = self.clone();
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(ExecutorError::Cancelled),
            result = fut => result,
        }
    }

    /// Sleep for `duration` unless cancellation fires first
    pub async fn sleep(&self, duration: Duration) -> ExecutorResult<()> {
        self.guard(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::never()
    }
}

//! Cancellation and timeout plumbing shared by the link workers.

use crate::error::{BridgeError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of one guarded link operation
#[derive(Debug)]
pub(crate) enum Step<T> {
    Done(T),
    Failed(BridgeError),
    Cancelled,
}

/// Run `fut` bounded by `limit`, unwinding early if `cancel` fires.
pub(crate) async fn guarded<T, F>(
    cancel: &CancellationToken,
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Step<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Step::Cancelled,
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(Ok(value)) => Step::Done(value),
            Ok(Err(e)) => Step::Failed(e),
            Err(_) => Step::Failed(BridgeError::timeout(operation, limit)),
        },
    }
}

/// Sleep for `delay`. Returns `false` if cancelled first.
pub(crate) async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// A spawned link worker and the token that stops it
pub(crate) struct Worker {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl Worker {
    /// Spawn `body` on the current runtime.
    pub(crate) fn spawn<F, Fut>(link: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BridgeError::unavailable(link, format!("no async runtime: {e}")))?;
        let cancel = CancellationToken::new();
        let join = runtime.spawn(body(cancel.clone()));
        Ok(Self { cancel, join })
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    /// Cancel and join, aborting the task if it outlives `limit`.
    pub(crate) async fn shutdown(self, component: &'static str, limit: Duration) -> Result<()> {
        let Worker { cancel, mut join } = self;
        cancel.cancel();
        match tokio::time::timeout(limit, &mut join).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::Shutdown {
                component,
                reason: e.to_string(),
            }),
            Err(_) => {
                join.abort();
                Err(BridgeError::Shutdown {
                    component,
                    reason: format!("worker did not stop within {limit:?}"),
                })
            }
        }
    }
}

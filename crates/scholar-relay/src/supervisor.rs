//! Owns the relay's background tasks and their shared cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How shutdown went.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that returned on their own after cancellation.
    pub stopped: Vec<&'static str>,
    /// Tasks that panicked.
    pub failed: usize,
    /// Tasks still running at the deadline.
    pub aborted: usize,
}

/// Each task gets a child of the root token, so cancelling the root stops
/// everything while a task may still cancel its own subtree.
#[derive(Debug)]
pub struct Supervisor {
    root: CancellationToken,
    tasks: JoinSet<&'static str>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    /// The root token. Cancelling it begins shutdown of every task.
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fut = task(self.root.child_token());
        self.tasks.spawn(async move {
            fut.await;
            name
        });
        tracing::debug!(task = name, "background task spawned");
    }

    /// Cancels every task and waits up to `timeout` for them to return.
    /// Whatever is still running after that is aborted.
    pub async fn shutdown(mut self, timeout: Duration) -> ShutdownReport {
        self.root.cancel();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(Ok(name))) => {
                    tracing::info!(task = name, "background task stopped");
                    report.stopped.push(name);
                }
                Ok(Some(Err(e))) => {
                    tracing::error!(error = %e, "background task panicked");
                    report.failed += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    report.aborted = self.tasks.len();
                    tracing::warn!(
                        remaining = report.aborted,
                        timeout_secs = timeout.as_secs(),
                        "background tasks did not stop in time, aborting"
                    );
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        report
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cancellation scopes for groups of tasks.
//!
//! A [`TaskGroup`] owns a child [`CancellationToken`] and a [`JoinSet`]. The
//! first task to fail with a real error cancels its siblings; waiting on the
//! group returns that error with the task name attached.

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

/// Race `fut` against `cancel`.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = fut => result,
    }
}

/// Sleep unless cancelled first.
pub async fn sleep(cancel: &CancellationToken, duration: Duration) -> Result<()> {
    cancellable(cancel, async {
        tokio::time::sleep(duration).await;
        Ok(())
    })
    .await
}

/// A background read feeding a channel. Await `task` after draining `rx` to
/// learn whether the read completed.
pub struct Yield<T> {
    pub rx: mpsc::Receiver<T>,
    pub task: JoinHandle<Result<()>>,
}

impl<T> Yield<T> {
    /// Drain everything and surface the producer's error, if any.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while let Some(item) = self.rx.recv().await {
            out.push(item);
        }
        self.task.await??;
        Ok(out)
    }
}

pub struct TaskGroup {
    cancel: CancellationToken,
    tasks: JoinSet<(String, Result<()>)>,
}

impl TaskGroup {
    /// A group cancelled together with `parent`.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        self.tasks.spawn(async move { (name, fut.await) });
    }

    /// Wait for every task. Returns the first non-cancellation error, or
    /// [`SyncError::Cancelled`] if the group was cancelled without one.
    pub async fn wait(mut self) -> Result<()> {
        let mut first: Option<SyncError> = None;
        let mut cancelled = false;

        while let Some(joined) = self.tasks.join_next().await {
            let (name, result) = match joined {
                Ok(done) => done,
                Err(e) => ("task".to_string(), Err(SyncError::from(e))),
            };
            match result {
                Ok(()) => debug!(task = %name, "Task finished"),
                Err(e) if e.is_cancelled() => cancelled = true,
                Err(e) => {
                    if first.is_none() {
                        warn!(task = %name, error = %e, "Task failed, cancelling siblings");
                        self.cancel.cancel();
                        first = Some(e.context(name));
                    }
                }
            }
        }

        match first {
            Some(e) => Err(e),
            None if cancelled || self.cancel.is_cancelled() => Err(SyncError::Cancelled),
            None => Ok(()),
        }
    }

    /// Cancel the group and wait at most `grace` for the tasks to stop.
    pub async fn shutdown(mut self, grace: Duration) {
        self.cancel.cancel();
        let drained = tokio::time::timeout(grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = self.tasks.len(), "Tasks did not stop in time, aborting");
            self.tasks.shutdown().await;
        }
    }
}

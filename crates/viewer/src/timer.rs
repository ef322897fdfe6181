//! Cancellable timer handles

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle to a spawned timer task.
///
/// The task is aborted on [`TimerHandle::cancel`] and on drop, so a handle
/// stored in a session never outlives it.
#[derive(Debug)]
pub struct TimerHandle {
    name: &'static str,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Run `fut` once after `delay`
    pub fn after<F>(name: &'static str, delay: Duration, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        });
        Self { name, task }
    }

    /// Wrap an already spawned task
    pub fn from_task(name: &'static str, task: JoinHandle<()>) -> Self {
        Self { name, task }
    }

    /// Timer label, for logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True once the task returned or was aborted
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Abort the timer task
    pub fn cancel(self) {
        // Drop aborts the task.
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

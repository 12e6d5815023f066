use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use crate::error::{Error, Result};

/// Task Supervisor - owns the engine's background loops
///
/// Loops are expected to run until their cancellation token fires. A loop
/// that finishes on its own has died, and `check_health` reports it.
///
/// ```ignore
/// let mut supervisor = TaskSupervisor::new();
/// supervisor.spawn("queue_processor", queue_processor(buffer, cancel.clone()));
///
/// cancel.cancel();
/// supervisor.shutdown(Duration::from_secs(10)).await;
/// ```
pub struct TaskSupervisor {
    tasks: HashMap<String, JoinHandle<()>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        TaskSupervisor {
            tasks: HashMap::new(),
        }
    }

    /// Spawn a new background task and register it for monitoring
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F) -> &mut Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let handle = tokio::spawn(future);

        info!("Spawned background task: {}", name);
        if let Some(previous) = self.tasks.insert(name.clone(), handle) {
            warn!("Task {} was already registered, aborting the previous one", name);
            previous.abort();
        }
        self
    }

    /// Returns an error naming every task that has terminated. Dead tasks stay
    /// registered, so they are reported on every call until `shutdown`.
    pub fn check_health(&self) -> Result<()> {
        let mut failed_tasks: Vec<&str> = self
            .tasks
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(name, _)| name.as_str())
            .collect();

        if failed_tasks.is_empty() {
            return Ok(());
        }
        failed_tasks.sort_unstable();

        let error_msg = format!("Tasks terminated unexpectedly: {:?}", failed_tasks);
        error!("{}", error_msg);
        Err(Error::TaskFailed(error_msg))
    }

    pub fn active_task_count(&self) -> usize {
        self.tasks.values().filter(|handle| !handle.is_finished()).count()
    }

    /// Waits for every task to finish, aborting whatever is still running when
    /// `grace` runs out. The tasks must already have been told to stop.
    pub async fn shutdown(&mut self, grace: Duration) {
        info!("Shutting down {} background tasks", self.tasks.len());
        let deadline = tokio::time::Instant::now() + grace;

        for (name, mut handle) in self.tasks.drain() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => info!("Task {} stopped", name),
                Ok(Err(e)) if e.is_panic() => error!("Task {} panicked: {}", name, e),
                Ok(Err(e)) => warn!("Task {} did not complete: {}", name, e),
                Err(_) => {
                    handle.abort();
                    warn!("Task {} ignored shutdown, aborted", name);
                }
            }
        }
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

//! Worker process launching.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use overseer_core::{RunId, Task};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Environment variable carrying the task id into the worker.
pub const ENV_TASK_ID: &str = "OVERSEER_TASK_ID";

/// Environment variable carrying the run id into the worker.
pub const ENV_RUN_ID: &str = "OVERSEER_RUN_ID";

/// Result of a launch attempt that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// A worker is running
    Started {
        /// Id of the new run
        run_id: RunId,
    },
    /// No seat free
    Unavailable,
}

/// Launcher failures.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Spawning the process failed
    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    /// Any other launcher failure
    #[error("{0}")]
    Other(String),
}

/// Starts and tracks worker processes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker for `task`.
    async fn launch(&self, task: &Task) -> Result<LaunchOutcome, LaunchError>;

    /// Whether the run's process is still alive.
    async fn is_alive(&self, run_id: &RunId) -> Result<bool, LaunchError>;

    /// Number of live worker processes.
    async fn process_count(&self) -> Result<usize, LaunchError>;
}

/// Launches a shell command per task.
///
/// Children are tracked in memory only: after a restart every previous run
/// is reported dead and goes through the liveness double-confirm.
pub struct CommandLauncher {
    command: String,
    max_seats: usize,
    children: Mutex<HashMap<RunId, Child>>,
}

impl CommandLauncher {
    /// Create a launcher running `command` through `sh -c`.
    pub fn new(command: impl Into<String>, max_seats: usize) -> Self {
        Self {
            command: command.into(),
            max_seats: max_seats.max(1),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn reap(children: &mut HashMap<RunId, Child>) {
        children.retain(|run_id, child| match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("Worker {} exited: {}", run_id, status);
                false
            }
            Err(e) => {
                debug!("Worker {} unreadable, dropping: {}", run_id, e);
                false
            }
        });
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, task: &Task) -> Result<LaunchOutcome, LaunchError> {
        let mut children = self.children.lock().await;
        Self::reap(&mut children);
        if children.len() >= self.max_seats {
            return Ok(LaunchOutcome::Unavailable);
        }

        let run_id = RunId::new();
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env(ENV_TASK_ID, task.id.to_string())
            .env(ENV_RUN_ID, run_id.as_str())
            .stdin(Stdio::null())
            .spawn()?;

        info!("Launched worker {} for task {} (pid {:?})", run_id, task.id, child.id());
        children.insert(run_id.clone(), child);
        Ok(LaunchOutcome::Started { run_id })
    }

    async fn is_alive(&self, run_id: &RunId) -> Result<bool, LaunchError> {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(run_id) else {
            return Ok(false);
        };
        match child.try_wait()? {
            None => Ok(true),
            Some(status) => {
                debug!("Worker {} exited: {}", run_id, status);
                children.remove(run_id);
                Ok(false)
            }
        }
    }

    async fn process_count(&self) -> Result<usize, LaunchError> {
        let mut children = self.children.lock().await;
        Self::reap(&mut children);
        Ok(children.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_dead(launcher: &CommandLauncher, run_id: &RunId) -> bool {
        for _ in 0..100 {
            if !launcher.is_alive(run_id).await.unwrap() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_seats_are_bounded() {
        let launcher = CommandLauncher::new("sleep 5", 1);
        let task = Task::new("Long worker", "d");

        let LaunchOutcome::Started { run_id } = launcher.launch(&task).await.unwrap() else {
            panic!("first launch should start");
        };
        assert!(launcher.is_alive(&run_id).await.unwrap());
        assert_eq!(launcher.process_count().await.unwrap(), 1);
        assert_eq!(launcher.launch(&task).await.unwrap(), LaunchOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_exited_worker_frees_seat() {
        let launcher = CommandLauncher::new("test -n \"$OVERSEER_RUN_ID\"", 1);
        let task = Task::new("Quick worker", "d");

        let LaunchOutcome::Started { run_id } = launcher.launch(&task).await.unwrap() else {
            panic!("launch should start");
        };
        assert!(wait_dead(&launcher, &run_id).await);
        assert_eq!(launcher.process_count().await.unwrap(), 0);
        assert!(matches!(
            launcher.launch(&task).await.unwrap(),
            LaunchOutcome::Started { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_run_is_dead() {
        let launcher = CommandLauncher::new("true", 2);
        assert!(!launcher.is_alive(&RunId::from("run_missing")).await.unwrap());
    }
}

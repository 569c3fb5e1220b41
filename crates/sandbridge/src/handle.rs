//! Worker handle for managing a running sandboxed worker.
//!
//! The [`WorkerHandle`] is the caller's interface to one worker:
//!
//! - Monitor status via [`WorkerHandle::status`]
//! - Take the three stream endpoints, each exactly once
//! - Wait for the worker to exit
//! - Terminate it via [`WorkerHandle::terminate`]
//!
//! # Lifecycle
//!
//! Workers returned by the launcher start in the `Running` state. They move to
//! `Exited` or `Failed` on their own, or to `Terminated` when the host tears
//! them down. Termination is abrupt and idempotent. Dropping the handle
//! terminates the worker too.

use crate::stream::{WorkerErrorStream, WorkerInput, WorkerOutput};
use sandbridge_core::{Error, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

/// How long [`WorkerHandle::terminate`] waits for the worker task to unwind.
pub const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Current status of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Worker is executing.
    Running,
    /// Worker returned from its entry point or called `proc_exit`.
    Exited {
        /// Exit code reported by the worker.
        exit_code: i32,
    },
    /// Worker trapped.
    Failed {
        /// Error message describing the failure.
        message: String,
    },
    /// Worker was terminated by the host.
    Terminated,
}

impl WorkerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkerStatus::Running)
    }
}

/// Shared status cell written by the worker task and by the handle.
#[derive(Clone)]
pub(crate) struct StatusCell {
    tx: Arc<watch::Sender<WorkerStatus>>,
}

impl StatusCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(WorkerStatus::Running);
        Self { tx: Arc::new(tx) }
    }

    /// Records a final status. Only the first transition out of `Running`
    /// sticks.
    pub(crate) fn finish(&self, status: WorkerStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_running() {
                *current = status;
                true
            } else {
                false
            }
        })
    }

    fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.tx.subscribe()
    }

    fn get(&self) -> WorkerStatus {
        self.tx.borrow().clone()
    }
}

/// Handle to a running worker.
pub struct WorkerHandle {
    id: Uuid,
    name: String,
    trace: bool,
    status: StatusCell,
    task: Mutex<Option<JoinHandle<()>>>,
    stdin: Option<WorkerInput>,
    stdout: Option<WorkerOutput>,
    stderr: Option<WorkerErrorStream>,
}

impl WorkerHandle {
    pub(crate) fn new(
        name: String,
        trace: bool,
        status: StatusCell,
        task: JoinHandle<()>,
        stdin: WorkerInput,
        stdout: WorkerOutput,
        stderr: WorkerErrorStream,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            trace,
            status,
            task: Mutex::new(Some(task)),
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr: Some(stderr),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Process name the worker was launched under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether stream traffic is logged at trace level.
    pub fn trace(&self) -> bool {
        self.trace
    }

    /// Returns the current status of the worker.
    pub fn status(&self) -> WorkerStatus {
        self.status.get()
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    /// Takes the write end of the worker's standard input.
    ///
    /// Returns `None` if it was already taken.
    pub fn take_stdin(&mut self) -> Option<WorkerInput> {
        self.stdin.take()
    }

    /// Takes the read end of the worker's standard output.
    pub fn take_stdout(&mut self) -> Option<WorkerOutput> {
        self.stdout.take()
    }

    /// Takes the read end of the worker's standard error.
    pub fn take_stderr(&mut self) -> Option<WorkerErrorStream> {
        self.stderr.take()
    }

    /// Waits for the worker to leave the `Running` state.
    pub async fn wait(&self) -> WorkerStatus {
        let mut rx = self.status.subscribe();
        match rx.wait_for(|status| !status.is_running()).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        }
    }

    /// Waits for the worker to exit with a timeout.
    ///
    /// Returns `None` if the timeout expires before the worker exits.
    pub async fn wait_timeout(&self, duration: Duration) -> Option<WorkerStatus> {
        timeout(duration, self.wait()).await.ok()
    }

    /// Terminates the worker immediately.
    ///
    /// All three streams observe EOF or a broken pipe afterwards. Calling this
    /// on a worker that already exited or was terminated does nothing.
    ///
    /// Fails with [`Error::Timeout`] if the worker task has not unwound
    /// within [`TERMINATE_TIMEOUT`]; the worker is marked terminated anyway.
    pub async fn terminate(&self) -> Result<()> {
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        let Some(task) = task else {
            return Ok(());
        };

        task.abort();
        // The task owns the worker's store and stream ends; once it is
        // joined they are dropped.
        let joined = timeout(TERMINATE_TIMEOUT, task).await;

        if self.status.finish(WorkerStatus::Terminated) {
            tracing::info!(worker = %self.name, id = %self.id, "worker terminated");
        }
        if joined.is_err() {
            tracing::warn!(worker = %self.name, id = %self.id, "worker did not stop in time");
            return Err(Error::Timeout(format!(
                "worker '{}' did not stop within {TERMINATE_TIMEOUT:?}",
                self.name
            )));
        }
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().ok().and_then(|task| task.take()) {
            task.abort();
            self.status.finish(WorkerStatus::Terminated);
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::pipe;

    fn create_test_handle(task: JoinHandle<()>, status: StatusCell) -> WorkerHandle {
        let (stdin, _) = pipe();
        let (stdout, _) = pipe();
        let (stderr, _) = pipe();
        WorkerHandle::new(
            "test".to_string(),
            false,
            status,
            task,
            WorkerInput::new(stdin, None),
            WorkerOutput::new(stdout, None),
            WorkerOutput::new(stderr, None),
        )
    }

    fn pending_task() -> JoinHandle<()> {
        tokio::spawn(std::future::pending::<()>())
    }

    #[tokio::test]
    async fn streams_can_be_taken_once() {
        let mut handle = create_test_handle(pending_task(), StatusCell::new());
        assert!(handle.take_stdin().is_some());
        assert!(handle.take_stdin().is_none());
        assert!(handle.take_stdout().is_some());
        assert!(handle.take_stdout().is_none());
        assert!(handle.take_stderr().is_some());
        assert!(handle.take_stderr().is_none());
    }

    #[tokio::test]
    async fn terminate_twice_is_a_noop() {
        let handle = create_test_handle(pending_task(), StatusCell::new());
        assert!(handle.is_running());

        handle.terminate().await.unwrap();
        assert_eq!(handle.status(), WorkerStatus::Terminated);

        handle.terminate().await.unwrap();
        assert_eq!(handle.status(), WorkerStatus::Terminated);
    }

    #[tokio::test]
    async fn terminate_keeps_exit_status_of_finished_worker() {
        let status = StatusCell::new();
        let task_status = status.clone();
        let task = tokio::spawn(async move {
            task_status.finish(WorkerStatus::Exited { exit_code: 3 });
        });
        let handle = create_test_handle(task, status);

        assert_eq!(handle.wait().await, WorkerStatus::Exited { exit_code: 3 });
        handle.terminate().await.unwrap();
        assert_eq!(handle.status(), WorkerStatus::Exited { exit_code: 3 });
    }

    #[tokio::test]
    async fn wait_timeout_expires_for_running_worker() {
        let handle = create_test_handle(pending_task(), StatusCell::new());
        assert_eq!(handle.wait_timeout(Duration::from_millis(20)).await, None);
    }

    #[tokio::test]
    async fn drop_marks_worker_terminated() {
        let status = StatusCell::new();
        let handle = create_test_handle(pending_task(), status.clone());
        drop(handle);
        assert_eq!(status.get(), WorkerStatus::Terminated);
    }

    #[test]
    fn only_first_final_status_sticks() {
        let status = StatusCell::new();
        assert!(status.finish(WorkerStatus::Failed {
            message: "trap".into()
        }));
        assert!(!status.finish(WorkerStatus::Terminated));
        assert!(matches!(status.get(), WorkerStatus::Failed { .. }));
    }
}

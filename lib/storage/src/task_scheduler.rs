//! `TaskScheduler` — the single serialized per-node queue for Watch/Load/
//! Release commands (spec.md §4.7). Tasks are FIFO: a heavy `LoadSegments`
//! task blocks a light `ReleaseSegments` task queued after it, matching the
//! spec's "heavy tasks block light ones" note, while each task still gets
//! its own deadline for context propagation (spec.md §5 cancellation
//! discipline: every long-running operation owns a context).
//!
//! Realized as one background `tokio::spawn`ed loop draining a bounded
//! `mpsc` channel (spec.md §9 "avoid unbounded channels; every producer
//! must respect back-pressure"), pairing each queued task with a one-shot
//! completion channel the submitter awaits.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::errors::{StorageError, StorageResult};

/// One Watch/Load/Release command (spec.md §4.7 "Each task has
/// PreExecute/Execute/PostExecute"). `pre_execute`/`post_execute` default to
/// no-ops so simple tasks only need to implement `execute`.
#[async_trait]
pub trait Task: Send {
    fn name(&self) -> &str;

    /// Validation step run before `execute`; a failure here skips
    /// `execute`/`post_execute` entirely.
    async fn pre_execute(&mut self) -> StorageResult<()> {
        Ok(())
    }

    async fn execute(&mut self) -> StorageResult<()>;

    /// Installation/cleanup step run after a successful `execute`.
    async fn post_execute(&mut self) -> StorageResult<()> {
        Ok(())
    }

    /// Deadline for `execute`, propagated as a `tokio::time::timeout`
    /// around the call. `None` means no deadline.
    fn deadline(&self) -> Option<Duration> {
        None
    }
}

pub type TaskOutcome = StorageResult<()>;

struct QueuedTask {
    task: Box<dyn Task>,
    completion: oneshot::Sender<TaskOutcome>,
}

/// FIFO command queue for one node. Cloning is not supported by design —
/// one scheduler owns one background loop; share it behind an `Arc` if
/// multiple callers submit concurrently.
pub struct TaskScheduler {
    tx: mpsc::Sender<QueuedTask>,
    loop_handle: Option<JoinHandle<()>>,
}

impl TaskScheduler {
    /// `queue_capacity` bounds how many submitted-but-not-yet-run tasks may
    /// be outstanding before `submit` blocks the caller (back-pressure).
    pub fn new(queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let loop_handle = tokio::spawn(run_loop(rx));
        TaskScheduler {
            tx,
            loop_handle: Some(loop_handle),
        }
    }

    /// Enqueues `task` and awaits its completion, returning whatever error
    /// `pre_execute`/`execute`/`post_execute` produced (spec.md §4.7 "a
    /// task's error is returned to the caller via a one-shot completion
    /// channel").
    pub async fn submit(&self, task: Box<dyn Task>) -> TaskOutcome {
        let (completion_tx, completion_rx) = oneshot::channel();
        self.tx
            .send(QueuedTask {
                task,
                completion: completion_tx,
            })
            .await
            .map_err(|_| StorageError::service_error("task scheduler is shut down"))?;
        completion_rx
            .await
            .map_err(|_| StorageError::service_error("task scheduler dropped the task before completion"))?
    }

    /// Stops accepting new tasks and waits for the background loop to
    /// drain whatever is already queued, then exit.
    pub async fn shutdown(mut self) {
        let (unused_tx, _unused_rx) = mpsc::channel(1);
        let live_tx = std::mem::replace(&mut self.tx, unused_tx);
        drop(live_tx);
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.await;
        }
    }
}

async fn run_one(task: &mut dyn Task) -> TaskOutcome {
    task.pre_execute().await?;
    match task.deadline() {
        Some(d) => match tokio::time::timeout(d, task.execute()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StorageError::service_error(format!(
                    "task {} exceeded its deadline",
                    task.name()
                )))
            }
        },
        None => task.execute().await?,
    }
    task.post_execute().await?;
    Ok(())
}

async fn run_loop(mut rx: mpsc::Receiver<QueuedTask>) {
    while let Some(mut queued) = rx.recv().await {
        let outcome = run_one(queued.task.as_mut()).await;
        if let Err(outcome) = &outcome {
            log::warn!("task {} failed: {outcome}", queued.task.name());
        }
        let _ = queued.completion.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    struct RecordingTask {
        name: String,
        order: Arc<Mutex<Vec<String>>>,
        sleep: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Task for RecordingTask {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&mut self) -> StorageResult<()> {
            if !self.sleep.is_zero() {
                tokio::time::sleep(self.sleep).await;
            }
            if self.fail {
                return Err(StorageError::service_error("injected failure"));
            }
            self.order.lock().push(self.name.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn tasks_run_fifo_and_serialize() {
        let scheduler = TaskScheduler::new(8);
        let order = Arc::new(Mutex::new(Vec::new()));

        scheduler
            .submit(Box::new(RecordingTask {
                name: "watch".into(),
                order: order.clone(),
                sleep: Duration::from_millis(20),
                fail: false,
            }))
            .await
            .unwrap();
        scheduler
            .submit(Box::new(RecordingTask {
                name: "load".into(),
                order: order.clone(),
                sleep: Duration::from_millis(0),
                fail: false,
            }))
            .await
            .unwrap();

        assert_eq!(*order.lock(), vec!["watch".to_string(), "load".to_string()]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn execute_failure_is_returned_to_the_submitter() {
        let scheduler = TaskScheduler::new(8);
        let order = Arc::new(Mutex::new(Vec::new()));
        let err = scheduler
            .submit(Box::new(RecordingTask {
                name: "release".into(),
                order,
                sleep: Duration::from_millis(0),
                fail: true,
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ServiceError { .. }));
        scheduler.shutdown().await;
    }

    struct SlowTask;

    #[async_trait]
    impl Task for SlowTask {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&mut self) -> StorageResult<()> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }

        fn deadline(&self) -> Option<Duration> {
            Some(Duration::from_millis(5))
        }
    }

    #[tokio::test]
    async fn deadline_exceeded_fails_the_task() {
        let scheduler = TaskScheduler::new(8);
        let err = scheduler.submit(Box::new(SlowTask)).await.unwrap_err();
        assert!(matches!(err, StorageError::ServiceError { .. }));
        scheduler.shutdown().await;
    }
}

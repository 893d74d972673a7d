//! Task queue between the sequencer and the worker pool

use crate::error::{PipelineError, PipelineResult};
use crate::workflow::types::StepTask;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: StepTask) -> PipelineResult<()>;
}

/// In-process queue; pending tasks are lost when the process exits
#[derive(Clone)]
pub struct LocalQueue {
    tx: mpsc::UnboundedSender<StepTask>,
}

impl LocalQueue {
    pub fn new() -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx },
            TaskReceiver {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn enqueue(&self, task: StepTask) -> PipelineResult<()> {
        self.tx
            .send(task)
            .map_err(|e| PipelineError::Queue(format!("Queue closed, dropped task for workflow {}", e.0.workflow_id)))
    }
}

/// Consumer side of a [`LocalQueue`], shared by every worker
#[derive(Clone)]
pub struct TaskReceiver {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<StepTask>>>,
}

impl TaskReceiver {
    /// Next task, or `None` once every sender is gone
    pub async fn recv(&self) -> Option<StepTask> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::steps::StepKind;
    use uuid::Uuid;

    fn task(step: StepKind) -> StepTask {
        StepTask {
            workflow_id: Uuid::new_v4(),
            step_index: 0,
            step,
            correlation_id: "b-1".to_string(),
            input: None,
        }
    }

    #[tokio::test]
    async fn test_tasks_arrive_in_order() {
        let (queue, receiver) = LocalQueue::new();
        queue.enqueue(task(StepKind::Inspect)).await.unwrap();
        queue.enqueue(task(StepKind::Archive)).await.unwrap();

        let other = receiver.clone();
        assert_eq!(receiver.recv().await.unwrap().step, StepKind::Inspect);
        assert_eq!(other.recv().await.unwrap().step, StepKind::Archive);
    }

    #[tokio::test]
    async fn test_closed_queue_is_an_error() {
        let (queue, receiver) = LocalQueue::new();
        drop(receiver);
        assert!(matches!(
            queue.enqueue(task(StepKind::Stage)).await,
            Err(PipelineError::Queue(_))
        ));
    }

    #[tokio::test]
    async fn test_receiver_ends_when_senders_drop() {
        let (queue, receiver) = LocalQueue::new();
        drop(queue);
        assert!(receiver.recv().await.is_none());
    }
}

//! Workflow sequencing tests: sequencer, local queue and worker pool together

use async_trait::async_trait;
use runstage_worker::error::{PipelineError, StepError, StepResult};
use runstage_worker::steps::{StepContext, StepHandler, StepKind, StepRegistry};
use runstage_worker::workflow::{
    LocalQueue, MemoryWorkflowStore, RetryPolicy, Sequencer, WorkerPool, Workflow, WorkflowStatus,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

enum Next {
    Retryable,
    Fatal,
    Panic,
}

#[derive(Debug, Clone, PartialEq)]
struct Call {
    step: StepKind,
    attempt: u32,
    input: Option<Value>,
}

type Calls = Arc<Mutex<Vec<Call>>>;

struct Scripted {
    kind: StepKind,
    calls: Calls,
    script: Mutex<VecDeque<Next>>,
}

#[async_trait]
impl StepHandler for Scripted {
    fn kind(&self) -> StepKind {
        self.kind
    }

    async fn run(&self, ctx: StepContext) -> StepResult {
        self.calls.lock().unwrap().push(Call {
            step: self.kind,
            attempt: ctx.attempt,
            input: ctx.input.clone(),
        });

        let next = self.script.lock().unwrap().pop_front();
        match next {
            None => Ok(json!({ "id": ctx.correlation_id, "done": self.kind.as_str() })),
            Some(Next::Retryable) => Err(StepError::Retryable(PipelineError::Storage(
                "connection reset".into(),
            ))),
            Some(Next::Fatal) => Err(StepError::Fatal(PipelineError::Validation(
                "file count mismatch".into(),
            ))),
            Some(Next::Panic) => panic!("handler bug"),
        }
    }
}

struct Harness {
    sequencer: Arc<Sequencer>,
    calls: Calls,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn harness(scripts: Vec<(StepKind, Vec<Next>)>, max_retries: u32) -> Harness {
    let calls: Calls = Arc::default();
    let mut scripts: std::collections::HashMap<StepKind, Vec<Next>> = scripts.into_iter().collect();

    let mut registry = StepRegistry::new();
    for kind in StepKind::ALL {
        registry.register(Arc::new(Scripted {
            kind,
            calls: calls.clone(),
            script: Mutex::new(scripts.remove(&kind).unwrap_or_default().into()),
        }));
    }
    let registry = Arc::new(registry);

    let (queue, receiver) = LocalQueue::new();
    let sequencer = Arc::new(Sequencer::new(
        Arc::new(MemoryWorkflowStore::new()),
        Arc::new(queue),
        registry.clone(),
    ));

    let policy = RetryPolicy {
        max_retries,
        delay: Duration::from_millis(1),
    };
    let shutdown = CancellationToken::new();
    Arc::new(WorkerPool::new(sequencer.clone(), registry, policy, 4)).spawn(receiver, shutdown.clone());

    Harness {
        sequencer,
        calls,
        shutdown,
    }
}

async fn start(h: &Harness, steps: &[&str]) -> Uuid {
    let id = h.sequencer.create(steps).await.unwrap();
    h.sequencer.bind(id, "b-1").await.unwrap();
    h.sequencer.start(id).await.unwrap();
    id
}

async fn wait_until(h: &Harness, id: Uuid, done: impl Fn(&Workflow) -> bool) -> Workflow {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let workflow = h.sequencer.get(id).await.unwrap();
            if done(&workflow) {
                return workflow;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}

fn settled(workflow: &Workflow) -> bool {
    !workflow.in_flight
        && matches!(
            workflow.status,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Paused
        )
}

fn steps_called(h: &Harness) -> Vec<StepKind> {
    h.calls.lock().unwrap().iter().map(|c| c.step).collect()
}

#[tokio::test]
async fn test_steps_run_in_order_with_previous_output() {
    let h = harness(vec![], 3);
    let id = start(&h, &["inspect", "archive", "stage"]).await;

    let workflow = wait_until(&h, id, settled).await;
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(
        steps_called(&h),
        vec![StepKind::Inspect, StepKind::Archive, StepKind::Stage]
    );

    let calls = h.calls.lock().unwrap().clone();
    assert_eq!(calls[0].input, None);
    assert_eq!(calls[1].input, Some(json!({ "id": "b-1", "done": "inspect" })));
    assert_eq!(calls[2].input, Some(json!({ "id": "b-1", "done": "archive" })));
    assert_eq!(workflow.last_output, Some(json!({ "id": "b-1", "done": "stage" })));
}

#[tokio::test]
async fn test_fatal_failure_halts_workflow() {
    let h = harness(vec![(StepKind::Inspect, vec![Next::Fatal])], 3);
    let id = start(&h, &["inspect", "archive", "stage"]).await;

    let workflow = wait_until(&h, id, settled).await;
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(workflow.current_step, 0);
    assert!(workflow.last_error.unwrap().contains("file count mismatch"));

    // no retry for fatal errors, later steps never dispatched
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(steps_called(&h), vec![StepKind::Inspect]);
}

#[tokio::test]
async fn test_retryable_failures_are_retried() {
    let h = harness(
        vec![(StepKind::Archive, vec![Next::Retryable, Next::Retryable])],
        3,
    );
    let id = start(&h, &["inspect", "archive", "stage"]).await;

    let workflow = wait_until(&h, id, settled).await;
    assert_eq!(workflow.status, WorkflowStatus::Completed);

    let archive_attempts: Vec<u32> = h
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.step == StepKind::Archive)
        .map(|c| c.attempt)
        .collect();
    assert_eq!(archive_attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_exhausted_retries_park_the_workflow() {
    let h = harness(
        vec![(StepKind::Archive, vec![Next::Retryable, Next::Retryable, Next::Retryable])],
        2,
    );
    let id = start(&h, &["inspect", "archive", "stage"]).await;

    let workflow = wait_until(&h, id, settled).await;
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(workflow.current_step, 1);
    assert!(workflow.last_error.unwrap().contains("connection reset"));
    assert_eq!(
        steps_called(&h),
        vec![StepKind::Inspect, StepKind::Archive, StepKind::Archive, StepKind::Archive]
    );

    // operator retry picks up at the parked step; the script is used up
    h.sequencer.retry(id).await.unwrap();
    let workflow = wait_until(&h, id, settled).await;
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(steps_called(&h).last(), Some(&StepKind::Stage));
}

#[tokio::test]
async fn test_panicking_step_fails_workflow() {
    let h = harness(vec![(StepKind::Stage, vec![Next::Panic])], 3);
    let id = start(&h, &["stage", "validate"]).await;

    let workflow = wait_until(&h, id, settled).await;
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert!(workflow.last_error.unwrap().contains("aborted"));
    assert_eq!(steps_called(&h), vec![StepKind::Stage]);
}

#[tokio::test]
async fn test_workflows_run_independently() {
    let h = harness(vec![(StepKind::Validate, vec![Next::Fatal])], 0);
    let failing = start(&h, &["validate", "report"]).await;
    let passing = start(&h, &["inspect", "archive"]).await;

    assert_eq!(
        wait_until(&h, failing, settled).await.status,
        WorkflowStatus::Failed
    );
    assert_eq!(
        wait_until(&h, passing, settled).await.status,
        WorkflowStatus::Completed
    );
}

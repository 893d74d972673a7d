//! Workflow sequencing
//!
//! A workflow is an ordered list of steps bound to one batch. The
//! [`Sequencer`] owns its state transitions, the [`TaskQueue`] carries one
//! [`StepTask`] at a time per workflow to the [`WorkerPool`], and the
//! [`WorkflowStore`] keeps the records.

pub mod pg;
pub mod pool;
pub mod queue;
pub mod routes;
pub mod sequencer;
pub mod store;
pub mod types;

pub use pg::PgWorkflowStore;
pub use pool::{RetryPolicy, WorkerPool, WorkflowProgress};
pub use queue::{LocalQueue, TaskQueue, TaskReceiver};
pub use routes::{router, workflow_routes};
pub use sequencer::{AdvanceOutcome, Sequencer};
pub use store::{MemoryWorkflowStore, WorkflowStore};
pub use types::{StepTask, Workflow, WorkflowStatus};

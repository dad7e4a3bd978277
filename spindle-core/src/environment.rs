//! Host environment contract.
//!
//! The runtime stays ignorant of history replay, decision-task
//! scheduling, and payload persistence; those live behind this trait.
//! The driver consumes exactly three things from the host: execution
//! metadata, a place to install its cancel callback, and the terminal
//! completion callback.

use std::time::Duration;

use bytes::Bytes;

/// Execution metadata the environment supplies to a running workflow.
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub domain: String,
    pub task_list: String,
    pub execution_start_to_close_timeout: Duration,
    pub task_start_to_close_timeout: Duration,
}

/// The host side of a workflow execution.
///
/// Implementations must be callable from any thread: the cancel
/// callback in particular fires from the host while the dispatcher is
/// idle between decision tasks.
pub trait WorkflowEnvironment: Send + Sync {
    /// Metadata for the current execution.
    fn workflow_info(&self) -> WorkflowInfo;

    /// Install the callback invoked when the host requests cancellation.
    /// May be invoked multiple times; cancellation is idempotent.
    fn register_cancel(&self, callback: Box<dyn Fn() + Send + Sync>);

    /// Report the workflow's terminal outcome: either a result payload
    /// or an error, never both.
    fn complete(&self, result: Option<Bytes>, error: Option<anyhow::Error>);
}

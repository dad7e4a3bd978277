//! Root driver for spindle workflows.

mod driver;

// Re-exports
pub use driver::{DriverError, SyncWorkflowDefinition, WorkflowDefinition};

pub use spindle_core::{
    Channel, Dispatcher, Selector, WorkflowContext, WorkflowEnvironment, WorkflowFuture,
    WorkflowInfo, WorkflowRegistry,
};

//! Root driver: wires a workflow function to a dispatcher and a host
//! environment.
//!
//! The host owns the outer loop (history replay, decision-task
//! scheduling) and pokes the driver once per decision task. The driver
//! runs the dispatcher until every coroutine is blocked, then reports
//! completion to the environment if the root coroutine produced its
//! result, or a failure if any coroutine panicked.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use spindle_core::context::{CancelHandle, RootResult, WorkflowContext};
use spindle_core::dispatcher::Dispatcher;
use spindle_core::environment::WorkflowEnvironment;
use spindle_core::error::panic_message;
use spindle_core::registry::WorkflowRegistry;
use spindle_core::workflow::UntypedWorkflow;

/// Errors from assembling a workflow definition.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The requested workflow type name is not in the registry.
    #[error("workflow type '{0}' is not registered")]
    NotRegistered(String),
}

/// The host-facing shape of a runnable workflow.
pub trait WorkflowDefinition {
    /// Start the workflow: build the root context and spawn the root
    /// coroutine. No user code runs until the first decision task.
    fn execute(&mut self, env: Arc<dyn WorkflowEnvironment>, input: Bytes);

    /// Drive the workflow for one decision task.
    fn on_decision_task_started(&mut self);

    /// Stack dump of all live coroutines.
    fn stack_trace(&self) -> String;

    /// Destroy all coroutines without waiting for their completion.
    fn close(&mut self);
}

struct CancelState {
    handle: Option<CancelHandle>,
    requested: bool,
}

/// Drives a workflow function as the root coroutine of a dispatcher.
pub struct SyncWorkflowDefinition {
    workflow: UntypedWorkflow,
    dispatcher: Option<Dispatcher>,
    root_ctx: Option<WorkflowContext>,
    root_result: Arc<RootResult>,
    cancel: Arc<Mutex<CancelState>>,
}

impl SyncWorkflowDefinition {
    pub fn new(workflow: UntypedWorkflow) -> Self {
        Self {
            workflow,
            dispatcher: None,
            root_ctx: None,
            root_result: Arc::new(RootResult::default()),
            cancel: Arc::new(Mutex::new(CancelState {
                handle: None,
                requested: false,
            })),
        }
    }

    /// Look a workflow up by type name and wrap it for execution.
    pub fn from_registry(registry: &WorkflowRegistry, name: &str) -> Result<Self, DriverError> {
        registry
            .get(name)
            .map(Self::new)
            .ok_or_else(|| DriverError::NotRegistered(name.to_string()))
    }

    fn dispatcher(&self) -> &Dispatcher {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => panic!("workflow was not started; call execute first"),
        }
    }
}

impl WorkflowDefinition for SyncWorkflowDefinition {
    fn execute(&mut self, env: Arc<dyn WorkflowEnvironment>, input: Bytes) {
        let root_result = Arc::new(RootResult::default());
        let root_ctx = WorkflowContext::background()
            .with_environment(Arc::clone(&env))
            .with_root_result(Arc::clone(&root_result));

        // The host may request cancellation before the dispatcher ever
        // runs, which is before the root coroutine installs its cancel
        // handle. The shared state remembers the request so the root
        // coroutine can fire the handle the moment it exists.
        let workflow = Arc::clone(&self.workflow);
        let cancel = Arc::clone(&self.cancel);
        let dispatcher = Dispatcher::new(&root_ctx, move |ctx| {
            let (ctx, handle) = ctx.with_cancel();
            {
                let mut state = cancel.lock();
                state.handle = Some(handle.clone());
                if state.requested {
                    handle.cancel();
                }
            }
            let result = workflow.execute(&ctx, input);
            ctx.set_root_result(result);
        });

        let cancel = Arc::clone(&self.cancel);
        env.register_cancel(Box::new(move || {
            let mut state = cancel.lock();
            // Repeated cancellations are harmless; the scope stays
            // cancelled.
            if let Some(handle) = &state.handle {
                handle.cancel();
            }
            state.requested = true;
        }));

        self.dispatcher = Some(dispatcher);
        self.root_ctx = Some(root_ctx);
        self.root_result = root_result;
    }

    fn on_decision_task_started(&mut self) {
        let env = self
            .root_ctx
            .as_ref()
            .map(WorkflowContext::environment)
            .unwrap_or_else(|| panic!("workflow was not started; call execute first"));

        let run = panic::catch_unwind(AssertUnwindSafe(|| {
            self.dispatcher().execute_until_all_blocked()
        }));
        match run {
            Err(payload) => {
                // Dispatcher misuse (re-entrant drive, use after close)
                // is fatal for the workflow as a whole.
                let message = panic_message(payload.as_ref());
                tracing::error!(error = %message, "dispatcher failure");
                env.complete(None, Some(anyhow::anyhow!(message)));
            }
            Ok(Err(panic_error)) => {
                tracing::error!(
                    error = %panic_error,
                    stack = %panic_error.stack_trace(),
                    "workflow coroutine panicked"
                );
                env.complete(None, Some(anyhow::Error::new(panic_error)));
            }
            Ok(Ok(())) => {
                match self.root_result.take() {
                    // Result not set: the workflow is still executing
                    // and will be driven again on a later decision task.
                    None => {}
                    Some(Ok(result)) => env.complete(Some(result), None),
                    Some(Err(error)) => env.complete(None, Some(error)),
                }
            }
        }
    }

    fn stack_trace(&self) -> String {
        self.dispatcher().stack_trace()
    }

    fn close(&mut self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.close();
        }
    }
}

//! The workflow contract.
//!
//! Workflow code must be deterministic: it communicates exclusively
//! through the runtime's channels, selectors, and futures, and spawns
//! concurrency only via [`WorkflowContext::new_coroutine`]. Anything
//! observable it does between suspension points must be a pure function
//! of its inputs, because the surrounding engine re-executes the code to
//! reconstruct state.

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

use crate::codec::{Codec, sealed};
use crate::context::WorkflowContext;

/// A workflow body: runs as the root coroutine, from encoded input to
/// encoded result.
pub trait Workflow: Send + Sync {
    fn execute(&self, ctx: &WorkflowContext, input: Bytes) -> Result<Bytes>;
}

/// A shared, type-erased workflow, as stored by the registry and run by
/// the driver.
pub type UntypedWorkflow = Arc<dyn Workflow>;

/// Wrapper that lifts a typed closure into a [`Workflow`] by running the
/// codec at both ends.
struct WorkflowFnWrapper<F, I, O, C> {
    func: F,
    codec: Arc<C>,
    _phantom: PhantomData<fn(I) -> O>,
}

impl<F, I, O, C> Workflow for WorkflowFnWrapper<F, I, O, C>
where
    F: Fn(&WorkflowContext, I) -> Result<O> + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
    C: Codec + sealed::DecodeValue<I> + sealed::EncodeValue<O>,
{
    fn execute(&self, ctx: &WorkflowContext, input: Bytes) -> Result<Bytes> {
        let decoded_input = self.codec.decode::<I>(input)?;
        let output = (self.func)(ctx, decoded_input)?;
        self.codec.encode(&output)
    }
}

/// Lift a typed workflow function into an [`UntypedWorkflow`].
pub fn workflow_fn<F, I, O, C>(codec: Arc<C>, func: F) -> UntypedWorkflow
where
    F: Fn(&WorkflowContext, I) -> Result<O> + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
    C: Codec + sealed::DecodeValue<I> + sealed::EncodeValue<O>,
{
    Arc::new(WorkflowFnWrapper {
        func,
        codec,
        _phantom: PhantomData,
    })
}

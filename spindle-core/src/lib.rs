//! Deterministic cooperative coroutine runtime for durable workflows.
//!
//! Workflow code written against this crate looks imperative: it blocks
//! on channels, selectors, and futures. Underneath, it executes inside
//! a single host thread at a time, in a reproducible order: the same inputs
//! always yield the same schedule and outputs. That determinism is what
//! lets an outer engine checkpoint, replay, and resume long-running
//! logic across process restarts.
//!
//! The pieces:
//!
//! - [`Dispatcher`] owns a set of coroutines and drives them round-robin
//!   until all are blocked or finished.
//! - [`Channel`] is the sole communication medium between coroutines,
//!   with synchronous and asynchronous send/receive, buffering, and
//!   closed-channel semantics.
//! - [`Selector`] waits on a disjunction of channel and future events.
//! - [`WorkflowFuture`] is a set-once value-or-error slot with chaining.
//! - [`WorkflowContext`] threads the environment, result slot, and the
//!   current coroutine through workflow code, and is the factory for
//!   everything above.

pub mod channel;
pub mod codec;
pub mod context;
pub mod dispatcher;
pub mod environment;
pub mod error;
pub mod future;
pub mod registry;
pub mod selector;
pub mod serialization;
pub mod workflow;

mod coroutine;

pub use channel::Channel;
pub use context::{CancelHandle, RootResult, WorkflowContext};
pub use dispatcher::Dispatcher;
pub use environment::{WorkflowEnvironment, WorkflowInfo};
pub use error::{PanicError, SharedError, SharedResult};
pub use future::{DecodedFuture, WorkflowFuture};
pub use registry::WorkflowRegistry;
pub use selector::Selector;
pub use workflow::{UntypedWorkflow, Workflow};

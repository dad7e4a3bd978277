//! Cooperative workflow context.
//!
//! The root driver builds a rooted context carrying the host
//! environment, the slot for the workflow's eventual result, and (once a
//! coroutine is spawned) the current coroutine's state. Child coroutines
//! inherit the context with their own state swapped in. All channel,
//! selector, and future construction goes through the context so that
//! naming is deterministic: names are drawn from the owning dispatcher's
//! monotonic per-kind counters.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::codec::sealed;
use crate::coroutine::CoroutineState;
use crate::environment::{WorkflowEnvironment, WorkflowInfo};
use crate::future::{DecodedFuture, WorkflowFuture};
use crate::selector::Selector;

/// Slot for the root coroutine's terminal outcome.
///
/// Starts empty and is set exactly once, when the root coroutine
/// returns. The driver reads it after each dispatcher run to decide
/// whether the workflow is complete.
#[derive(Default)]
pub struct RootResult {
    slot: Mutex<Option<Result<Bytes>>>,
}

impl RootResult {
    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn take(&self) -> Option<Result<Bytes>> {
        self.slot.lock().take()
    }

    fn set(&self, result: Result<Bytes>) {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            drop(slot);
            panic!("workflow result already set");
        }
        *slot = Some(result);
    }
}

struct CancelScope {
    requested: Mutex<bool>,
    done: Channel<()>,
}

/// Handle that cancels the context it was derived from. Cancelling is
/// idempotent and may be invoked from any thread; the first call closes
/// the scope's done channel, waking everything blocked on it.
#[derive(Clone)]
pub struct CancelHandle {
    scope: Arc<CancelScope>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let mut requested = self.scope.requested.lock();
        if *requested {
            return;
        }
        *requested = true;
        drop(requested);
        self.scope.done.close();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.scope.requested.lock()
    }
}

/// Context threaded through every workflow coroutine.
///
/// Cloning is cheap; all fields are shared handles.
#[derive(Clone, Default)]
pub struct WorkflowContext {
    env: Option<Arc<dyn WorkflowEnvironment>>,
    root_result: Option<Arc<RootResult>>,
    state: Option<Arc<CoroutineState>>,
    cancel: Option<Arc<CancelScope>>,
}

impl WorkflowContext {
    /// An empty root context; the driver layers the environment and
    /// result slot on top before spawning the root coroutine.
    pub fn background() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_environment(mut self, env: Arc<dyn WorkflowEnvironment>) -> Self {
        self.env = Some(env);
        self
    }

    #[must_use]
    pub fn with_root_result(mut self, slot: Arc<RootResult>) -> Self {
        self.root_result = Some(slot);
        self
    }

    pub(crate) fn with_coroutine_state(&self, state: Arc<CoroutineState>) -> Self {
        let mut child = self.clone();
        child.state = Some(state);
        child
    }

    pub(crate) fn coroutine_state(&self) -> &Arc<CoroutineState> {
        match &self.state {
            Some(state) => state,
            None => panic!("not a coroutine context"),
        }
    }

    /// The host environment this workflow runs against.
    ///
    /// # Panics
    ///
    /// Panics when the context was not built by the root driver.
    pub fn environment(&self) -> Arc<dyn WorkflowEnvironment> {
        match &self.env {
            Some(env) => Arc::clone(env),
            None => panic!("not a workflow context"),
        }
    }

    /// Execution metadata supplied by the environment.
    pub fn workflow_info(&self) -> WorkflowInfo {
        self.environment().workflow_info()
    }

    /// Record the root coroutine's terminal outcome.
    pub fn set_root_result(&self, result: Result<Bytes>) {
        match &self.root_result {
            Some(slot) => slot.set(result),
            None => panic!("not a workflow context"),
        }
    }

    /// Spawn a child coroutine running `f`. The child inherits this
    /// context and is observed by the dispatcher on the same driver
    /// call.
    pub fn new_coroutine(&self, f: impl FnOnce(WorkflowContext) + Send + 'static) {
        self.coroutine_state().dispatcher().new_coroutine(self, f);
    }

    /// Spawn a named child coroutine; the name shows up in blocking
    /// statuses and stack dumps.
    pub fn new_named_coroutine(
        &self,
        name: impl Into<String>,
        f: impl FnOnce(WorkflowContext) + Send + 'static,
    ) {
        self.coroutine_state()
            .dispatcher()
            .new_named_coroutine(self, name.into(), f);
    }

    /// Create an unbuffered channel with an auto-generated name.
    pub fn new_channel<T: Send + 'static>(&self) -> Channel<T> {
        let sequence = self.coroutine_state().dispatcher().next_channel_sequence();
        Channel::new(format!("chan-{sequence}"), 0)
    }

    /// Create a named unbuffered channel.
    pub fn new_named_channel<T: Send + 'static>(&self, name: impl Into<String>) -> Channel<T> {
        Channel::new(name.into(), 0)
    }

    /// Create a buffered channel with an auto-generated name.
    pub fn new_buffered_channel<T: Send + 'static>(&self, capacity: usize) -> Channel<T> {
        let sequence = self.coroutine_state().dispatcher().next_channel_sequence();
        Channel::new(format!("chan-{sequence}"), capacity)
    }

    /// Create a named buffered channel.
    pub fn new_named_buffered_channel<T: Send + 'static>(
        &self,
        name: impl Into<String>,
        capacity: usize,
    ) -> Channel<T> {
        Channel::new(name.into(), capacity)
    }

    /// Create a selector with an auto-generated name.
    pub fn new_selector(&self) -> Selector {
        let sequence = self.coroutine_state().dispatcher().next_selector_sequence();
        Selector::new(format!("selector-{sequence}"))
    }

    /// Create a named selector.
    pub fn new_named_selector(&self, name: impl Into<String>) -> Selector {
        Selector::new(name.into())
    }

    /// Create an unresolved future.
    pub fn new_future<T: Clone + Send + 'static>(&self) -> WorkflowFuture<T> {
        WorkflowFuture::new(self.new_channel())
    }

    /// Create an unresolved future whose payload is decoded through
    /// `decoder` on observation.
    pub fn new_decoded_future<T: Send + 'static>(
        &self,
        decoder: Arc<dyn sealed::DecodeValue<T>>,
    ) -> DecodedFuture<T> {
        DecodedFuture::new(self.new_future(), decoder)
    }

    /// Derive a cancellable child context and the handle that cancels
    /// it. The scope's done channel is created through this context, so
    /// the call must run inside a coroutine.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let scope = Arc::new(CancelScope {
            requested: Mutex::new(false),
            done: self.new_channel(),
        });
        let handle = CancelHandle {
            scope: Arc::clone(&scope),
        };
        let mut child = self.clone();
        child.cancel = Some(scope);
        (child, handle)
    }

    /// The channel closed when this context is cancelled, if the
    /// context is inside a cancel scope.
    pub fn done(&self) -> Option<Channel<()>> {
        self.cancel.as_ref().map(|scope| scope.done.clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|scope| *scope.requested.lock())
    }
}

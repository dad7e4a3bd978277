//! The dispatcher owns a set of coroutines and drives them round-robin
//! until all are blocked or finished.
//!
//! Exactly one coroutine executes at any instant: the dispatcher is
//! blocked inside [`CoroutineState::call`] while a task runs, and every
//! task is blocked in its suspension point the rest of the time. The
//! `executing` and `closed` flags are the only state touched outside
//! that single-runner regime, so the whole dispatcher state sits behind
//! one mutex that is never held across a handoff.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::context::WorkflowContext;
use crate::coroutine::{
    self, CoroutineState, TerminateCoroutine, clean_stack_trace,
};
use crate::error::{PanicError, panic_message};

struct DispatcherState {
    sequence: u64,
    channel_sequence: u64,
    selector_sequence: u64,
    coroutines: Vec<Arc<CoroutineState>>,
    executing: bool,
    closed: bool,
}

pub(crate) struct DispatcherCore {
    state: Mutex<DispatcherState>,
}

/// Container of a set of coroutines, driven one decision task at a time.
#[derive(Clone)]
pub struct Dispatcher {
    core: Arc<DispatcherCore>,
}

impl Dispatcher {
    /// Create a dispatcher whose root coroutine runs `root` with a child
    /// of `root_ctx`, so `root_ctx` can carry values into the coroutine
    /// code.
    pub fn new(
        root_ctx: &WorkflowContext,
        root: impl FnOnce(WorkflowContext) + Send + 'static,
    ) -> Self {
        let dispatcher = Self {
            core: Arc::new(DispatcherCore {
                state: Mutex::new(DispatcherState {
                    sequence: 0,
                    channel_sequence: 0,
                    selector_sequence: 0,
                    coroutines: Vec::new(),
                    executing: false,
                    closed: false,
                }),
            }),
        };
        Arc::clone(&dispatcher.core).new_coroutine(root_ctx, root);
        dispatcher
    }

    /// Execute coroutines one by one in deterministic order until every
    /// one of them is completed or blocked, returning the first captured
    /// panic.
    ///
    /// # Panics
    ///
    /// Panics on re-entrant invocation or use after [`Dispatcher::close`].
    pub fn execute_until_all_blocked(&self) -> Result<(), PanicError> {
        {
            let mut st = self.core.state.lock();
            if st.closed {
                drop(st);
                panic!("dispatcher is closed");
            }
            if st.executing {
                drop(st);
                panic!("execute_until_all_blocked called while it is already running");
            }
            st.executing = true;
        }
        let _guard = ExecutingGuard {
            core: &self.core,
        };

        let mut all_blocked = false;
        while !all_blocked {
            // Give every coroutine a chance to run, removing finished
            // ones as they are observed.
            all_blocked = true;
            let last_sequence = self.core.state.lock().sequence;
            let mut index = 0;
            loop {
                let coroutine = {
                    let st = self.core.state.lock();
                    match st.coroutines.get(index) {
                        Some(c) => Arc::clone(c),
                        None => break,
                    }
                };
                if !coroutine.is_closed() {
                    coroutine.call();
                }
                // The call can finish the coroutine, so check again.
                if coroutine.is_closed() {
                    self.core.state.lock().coroutines.remove(index);
                    if let Some(error) = coroutine.panic_error() {
                        tracing::debug!(
                            coroutine = coroutine.name(),
                            error = %error,
                            "coroutine panicked"
                        );
                        return Err(error);
                    }
                    all_blocked = false;
                } else {
                    all_blocked = all_blocked && coroutine.kept_blocked();
                    index += 1;
                }
            }
            let st = self.core.state.lock();
            // Coroutines spawned during the pass also count as progress.
            all_blocked = all_blocked && last_sequence == st.sequence;
            if st.coroutines.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// True when no coroutines remain.
    pub fn is_done(&self) -> bool {
        self.core.state.lock().coroutines.is_empty()
    }

    /// Terminate all live coroutines without waiting for their
    /// completion. Idempotent.
    pub fn close(&self) {
        let coroutines = {
            let mut st = self.core.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.coroutines.clone()
        };
        tracing::debug!(live = coroutines.len(), "closing dispatcher");
        for coroutine in coroutines {
            if !coroutine.is_closed() {
                coroutine.exit();
            }
        }
    }

    /// Stack dump of every live coroutine, each entry headed
    /// `coroutine <name> [<status>]:`.
    pub fn stack_trace(&self) -> String {
        let coroutines = self.core.state.lock().coroutines.clone();
        let mut result = String::new();
        for coroutine in coroutines {
            if coroutine.is_closed() {
                continue;
            }
            if let Some(trace) = coroutine.stack_trace() {
                if !result.is_empty() {
                    result.push_str("\n\n");
                }
                result.push_str(&trace);
            }
        }
        result
    }
}

struct ExecutingGuard<'a> {
    core: &'a Arc<DispatcherCore>,
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.core.state.lock().executing = false;
    }
}

impl DispatcherCore {
    pub(crate) fn new_coroutine(
        self: Arc<Self>,
        ctx: &WorkflowContext,
        f: impl FnOnce(WorkflowContext) + Send + 'static,
    ) {
        let name = (self.state.lock().sequence + 1).to_string();
        self.new_named_coroutine(ctx, name, f);
    }

    pub(crate) fn new_named_coroutine(
        self: Arc<Self>,
        ctx: &WorkflowContext,
        name: String,
        f: impl FnOnce(WorkflowContext) + Send + 'static,
    ) {
        let state = Arc::new(CoroutineState::new(name, Arc::downgrade(&self)));
        {
            let mut st = self.state.lock();
            st.sequence += 1;
            st.coroutines.push(Arc::clone(&state));
        }
        let spawned_ctx = ctx.with_coroutine_state(Arc::clone(&state));
        spawn_coroutine(state, spawned_ctx, f);
    }

    pub(crate) fn next_channel_sequence(&self) -> u64 {
        let mut st = self.state.lock();
        st.channel_sequence += 1;
        st.channel_sequence
    }

    pub(crate) fn next_selector_sequence(&self) -> u64 {
        let mut st = self.state.lock();
        st.selector_sequence += 1;
        st.selector_sequence
    }
}

/// Launch the host thread for a coroutine: initial yield, user function,
/// then closure of the coroutine state, capturing any panic with a
/// cleaned stack trace on the way out.
fn spawn_coroutine(
    state: Arc<CoroutineState>,
    ctx: WorkflowContext,
    f: impl FnOnce(WorkflowContext) + Send + 'static,
) {
    coroutine::install_panic_hook();
    let name = state.name().to_string();
    tracing::trace!(coroutine = %name, "spawning coroutine");
    thread::Builder::new()
        .name(format!("coroutine-{name}"))
        .spawn(move || {
            coroutine::mark_coroutine_thread();
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                state.initial_yield(1, "");
                f(ctx);
            }));
            if let Err(payload) = result
                && payload.downcast_ref::<TerminateCoroutine>().is_none()
            {
                let raw = coroutine::take_last_panic_trace().unwrap_or_default();
                let trace = clean_stack_trace(&name, "panic", &raw, 0);
                state.record_panic(PanicError::new(panic_message(payload.as_ref()), trace));
            }
            state.close();
        })
        .expect("failed to spawn coroutine host thread");
}

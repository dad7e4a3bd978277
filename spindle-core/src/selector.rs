//! Disjunctive wait over channel and future events.
//!
//! A selector holds an ordered list of cases and fires exactly one of
//! them. [`Selector::select`] consumes the selector: it first probes
//! every case in insertion order without registering anything, fires the
//! first synchronously-ready case (or the default) and returns. Only
//! when nothing is ready and no default exists does a second pass park a
//! callback on each case and suspend the coroutine. The first callback
//! to fire latches the winning branch; later callbacks observe the latch
//! and decline their value so it stays deliverable elsewhere.
//!
//! Probing and registering in separate passes means a selector that
//! returns synchronously leaves no callbacks behind on any channel.
//! Because exactly one coroutine runs at a time, no case can become
//! ready between the two passes.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{AcceptFn, Channel, ReceiveCallback, SendAttempt};
use crate::context::WorkflowContext;
use crate::future::WorkflowFuture;

type ReadyFn = Box<dyn FnOnce() + Send>;

/// Latch for the winning branch. The first case callback to fire stores
/// its handler here; everyone after that backs off.
type ReadyBranch = Arc<Mutex<Option<ReadyFn>>>;

trait SelectCase: Send {
    /// Non-registering attempt; fires the case handler and returns true
    /// when the case is synchronously ready.
    fn probe(&mut self) -> bool;

    /// Park a callback that latches `ready` when the case's external
    /// event fires.
    fn register(&mut self, ready: &ReadyBranch);
}

struct ReceiveCase<T> {
    channel: Channel<T>,
    handler: Option<Box<dyn FnOnce(Option<T>, bool) + Send>>,
}

impl<T: Send + 'static> SelectCase for ReceiveCase<T> {
    fn probe(&mut self) -> bool {
        let (value, ok, more) = self.channel.receive_async_impl(None);
        if ok || !more {
            let handler = self.handler.take().expect("selector case fired twice");
            handler(value, more);
            return true;
        }
        false
    }

    fn register(&mut self, ready: &ReadyBranch) {
        let ready = Arc::clone(ready);
        let mut handler = self.handler.take();
        let callback: ReceiveCallback<T> = Box::new(move |value, more| {
            let mut branch = ready.lock();
            if branch.is_some() {
                return value;
            }
            let handler = handler.take().expect("selector case fired twice");
            *branch = Some(Box::new(move || handler(value, more)));
            None
        });
        let (_, ok, more) = self.channel.receive_async_impl(Some(callback));
        if ok || !more {
            panic!("selector case became ready during callback registration");
        }
    }
}

struct SendCase<T> {
    channel: Channel<T>,
    value: Option<T>,
    handler: Option<Box<dyn FnOnce() + Send>>,
}

impl<T: Send + 'static> SelectCase for SendCase<T> {
    fn probe(&mut self) -> bool {
        let value = self.value.take().expect("selector case fired twice");
        match self.channel.send_async_impl(value, None) {
            SendAttempt::Delivered => {
                let handler = self.handler.take().expect("selector case fired twice");
                handler();
                true
            }
            SendAttempt::Full(value) => {
                self.value = Some(value);
                false
            }
            SendAttempt::Registered => unreachable!("probe never registers"),
        }
    }

    fn register(&mut self, ready: &ReadyBranch) {
        let ready = Arc::clone(ready);
        let mut handler = self.handler.take();
        let accepted: AcceptFn = Box::new(move || {
            let mut branch = ready.lock();
            if branch.is_some() {
                return false;
            }
            let handler = handler.take().expect("selector case fired twice");
            *branch = Some(Box::new(handler));
            true
        });
        let value = self.value.take().expect("selector case fired twice");
        match self.channel.send_async_impl(value, Some(accepted)) {
            SendAttempt::Registered => {}
            SendAttempt::Delivered => {
                panic!("selector case became ready during callback registration")
            }
            SendAttempt::Full(_) => unreachable!("pending send was not registered"),
        }
    }
}

struct FutureCase<T> {
    future: WorkflowFuture<T>,
    handler: Option<Box<dyn FnOnce(WorkflowFuture<T>) + Send>>,
}

impl<T: Clone + Send + 'static> SelectCase for FutureCase<T> {
    fn probe(&mut self) -> bool {
        if self.future.is_ready() {
            let handler = self.handler.take().expect("selector case fired twice");
            handler(self.future.clone());
            return true;
        }
        false
    }

    fn register(&mut self, ready: &ReadyBranch) {
        let ready = Arc::clone(ready);
        let mut handler = self.handler.take();
        let future = self.future.clone();
        let callback: ReceiveCallback<()> = Box::new(move |value, _more| {
            let mut branch = ready.lock();
            if branch.is_some() {
                return value;
            }
            let handler = handler.take().expect("selector case fired twice");
            let future = future.clone();
            *branch = Some(Box::new(move || handler(future)));
            None
        });
        if self.future.get_async(callback).is_some() {
            panic!("selector case became ready during callback registration");
        }
    }
}

/// A disjunctive wait over channel send/receive and future-ready events
/// with an optional default, consumed by a single call to
/// [`Selector::select`].
pub struct Selector {
    name: String,
    cases: Vec<Box<dyn SelectCase>>,
    default_case: Option<Box<dyn FnOnce() + Send>>,
}

impl Selector {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            cases: Vec::new(),
            default_case: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a receive case; the handler gets the received value (`None`
    /// once the channel is closed and drained).
    #[must_use]
    pub fn add_receive<T: Send + 'static>(
        self,
        channel: &Channel<T>,
        handler: impl FnOnce(Option<T>) + Send + 'static,
    ) -> Self {
        self.add_receive_with_more_flag(channel, move |value, _more| handler(value))
    }

    /// Add a receive case whose handler also gets the more flag.
    #[must_use]
    pub fn add_receive_with_more_flag<T: Send + 'static>(
        mut self,
        channel: &Channel<T>,
        handler: impl FnOnce(Option<T>, bool) + Send + 'static,
    ) -> Self {
        self.cases.push(Box::new(ReceiveCase {
            channel: channel.clone(),
            handler: Some(Box::new(handler)),
        }));
        self
    }

    /// Add a send case; the handler runs once the channel accepts the
    /// value.
    #[must_use]
    pub fn add_send<T: Send + 'static>(
        mut self,
        channel: &Channel<T>,
        value: T,
        handler: impl FnOnce() + Send + 'static,
    ) -> Self {
        self.cases.push(Box::new(SendCase {
            channel: channel.clone(),
            value: Some(value),
            handler: Some(Box::new(handler)),
        }));
        self
    }

    /// Add a future-ready case; the handler receives the future so it
    /// can `get` the completion without blocking.
    #[must_use]
    pub fn add_future<T: Clone + Send + 'static>(
        mut self,
        future: &WorkflowFuture<T>,
        handler: impl FnOnce(WorkflowFuture<T>) + Send + 'static,
    ) -> Self {
        self.cases.push(Box::new(FutureCase {
            future: future.clone(),
            handler: Some(Box::new(handler)),
        }));
        self
    }

    /// Set the default case, fired when no other case is synchronously
    /// ready.
    #[must_use]
    pub fn add_default(mut self, handler: impl FnOnce() + Send + 'static) -> Self {
        self.default_case = Some(Box::new(handler));
        self
    }

    /// Fire exactly one case. The earliest synchronously-ready case (by
    /// insertion order) wins; failing that the default; failing that the
    /// coroutine suspends until the first case whose external event
    /// fires.
    pub fn select(mut self, ctx: &WorkflowContext) {
        for case in &mut self.cases {
            if case.probe() {
                return;
            }
        }
        if let Some(default_case) = self.default_case.take() {
            default_case();
            return;
        }

        let state = ctx.coroutine_state();
        let ready: ReadyBranch = Arc::new(Mutex::new(None));
        for case in &mut self.cases {
            case.register(&ready);
        }
        loop {
            let fired = ready.lock().take();
            if let Some(branch) = fired {
                branch();
                state.unblocked();
                return;
            }
            state.yield_now(&format!("blocked on {}.Select", self.name));
        }
    }
}

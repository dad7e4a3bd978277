//! Set-once futures layered on channel close.
//!
//! A future wraps an internal channel used purely as a one-shot close
//! signal: setting the future closes the channel, which wakes any
//! coroutine blocked in `get` and any selector registered on the future.
//! Completion cascades to every future chained onto this one.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::channel::{Channel, ReceiveCallback};
use crate::codec::sealed;
use crate::context::WorkflowContext;
use crate::error::{SharedError, SharedResult};

struct FutureState<T> {
    result: Option<SharedResult<T>>,
    chained: Vec<WorkflowFuture<T>>,
}

struct FutureInner<T> {
    state: Mutex<FutureState<T>>,
    channel: Channel<()>,
}

/// A set-once `(value, error)` slot with chain-on-completion semantics.
///
/// Handles are cheap to clone; the value must be `Clone` because every
/// chained future and every `get` observes the same completion.
pub struct WorkflowFuture<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for WorkflowFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> WorkflowFuture<T> {
    pub(crate) fn new(channel: Channel<()>) -> Self {
        Self {
            inner: Arc::new(FutureInner {
                state: Mutex::new(FutureState {
                    result: None,
                    chained: Vec::new(),
                }),
                channel,
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().result.is_some()
    }

    /// Block until the future is ready, then return its completion.
    ///
    /// May be called any number of times once the future is ready.
    pub fn get(&self, ctx: &WorkflowContext) -> SharedResult<T> {
        let (_, more) = self.inner.channel.receive_with_more_flag(ctx);
        if more {
            panic!("future signal channel delivered a value before close");
        }
        match self.inner.state.lock().result.clone() {
            Some(result) => result,
            None => panic!("future observed as complete before it was set"),
        }
    }

    /// Complete the future.
    ///
    /// # Panics
    ///
    /// Panics if the future is already set.
    pub fn set(&self, result: Result<T>) {
        self.set_shared(result.map_err(Arc::new));
    }

    /// Complete the future with a value.
    pub fn set_value(&self, value: T) {
        self.set_shared(Ok(value));
    }

    /// Complete the future with an error.
    pub fn set_error(&self, error: anyhow::Error) {
        self.set_shared(Err(Arc::new(error)));
    }

    /// Attach this future to `other`: when `other` completes, this
    /// future completes with the same result. If `other` is already
    /// ready its result is copied synchronously.
    ///
    /// # Panics
    ///
    /// Panics if this future is already set, or when chaining a future
    /// to itself.
    pub fn chain(&self, other: &WorkflowFuture<T>) {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            panic!("cannot chain a future to itself");
        }
        if self.is_ready() {
            panic!("future already set");
        }
        let ready = {
            let mut st = other.inner.state.lock();
            match st.result.clone() {
                Some(result) => result,
                None => {
                    st.chained.push(self.clone());
                    return;
                }
            }
        };
        self.set_shared(ready);
    }

    /// Selector entry point. Returns the completion when already ready;
    /// otherwise parks `callback` on the internal channel, to be invoked
    /// on close.
    pub(crate) fn get_async(&self, callback: ReceiveCallback<()>) -> Option<SharedResult<T>> {
        let (_, _, more) = self.inner.channel.receive_async_impl(Some(callback));
        if more {
            return None;
        }
        match self.inner.state.lock().result.clone() {
            Some(result) => Some(result),
            None => panic!("future observed as complete before it was set"),
        }
    }

    fn set_shared(&self, result: SharedResult<T>) {
        let chained = {
            let mut st = self.inner.state.lock();
            if st.result.is_some() {
                drop(st);
                panic!("future already set");
            }
            st.result = Some(result.clone());
            std::mem::take(&mut st.chained)
        };
        // Close outside the lock: the close wakes selector callbacks
        // which may probe this future's readiness.
        self.inner.channel.close();
        for downstream in chained {
            downstream.set_shared(result.clone());
        }
    }
}

/// A future whose completion carries an encoded payload that is decoded
/// on observation.
///
/// The producer side sets raw bytes through [`DecodedFuture::raw`];
/// `get` blocks on the underlying future and then runs the decoder. A
/// decode failure is returned to the caller rather than aborting the
/// coroutine.
pub struct DecodedFuture<T> {
    raw: WorkflowFuture<Bytes>,
    decoder: Arc<dyn sealed::DecodeValue<T>>,
}

impl<T> Clone for DecodedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            decoder: Arc::clone(&self.decoder),
        }
    }
}

impl<T: Send + 'static> DecodedFuture<T> {
    pub(crate) fn new(raw: WorkflowFuture<Bytes>, decoder: Arc<dyn sealed::DecodeValue<T>>) -> Self {
        Self { raw, decoder }
    }

    /// The underlying byte-carrying future, for the producer side.
    pub fn raw(&self) -> &WorkflowFuture<Bytes> {
        &self.raw
    }

    pub fn is_ready(&self) -> bool {
        self.raw.is_ready()
    }

    /// Block until the producer completes the future, then decode the
    /// payload.
    pub fn get(&self, ctx: &WorkflowContext) -> Result<T> {
        let bytes = self.raw.get(ctx).map_err(shared_to_anyhow)?;
        self.decoder.decode_value(bytes)
    }
}

fn shared_to_anyhow(error: SharedError) -> anyhow::Error {
    anyhow::anyhow!("{error:#}")
}

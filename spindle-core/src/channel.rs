//! FIFO channel for inter-coroutine communication.
//!
//! A channel is the only communication medium between coroutines.
//! Blocking operations suspend the calling coroutine through its
//! [`WorkflowContext`]; non-blocking variants never suspend. Waiters are
//! serviced strictly in the order they blocked, and a synchronous
//! rendezvous always outruns buffering: a send hands its value straight
//! to a waiting receiver rather than depositing it into the buffer.
//!
//! The callback convention makes selectors composable. A registered
//! receive callback is handed the value and either keeps it (returns
//! `None`) or hands it back (returns `Some(value)`) so the channel can
//! offer it to the next waiter. A pending sender's accept callback
//! returns whether the sender still wants its value delivered.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::context::WorkflowContext;

/// Invoked when a value (or the close signal) is offered to a blocked
/// receiver. Arguments are the value (`None` once the channel is closed
/// and drained) and the more flag. Returning `None` accepts the
/// delivery; returning `Some(value)` declines it and the value stays up
/// for delivery to the next waiter.
pub(crate) type ReceiveCallback<T> = Box<dyn FnMut(Option<T>, bool) -> Option<T> + Send>;

/// Invoked when a pending sender's value is about to be consumed.
/// Returning `false` means the sender no longer wants the delivery (its
/// selector already fired another case) and the value is dropped.
pub(crate) type AcceptFn = Box<dyn FnMut() -> bool + Send>;

struct BlockedSend<T> {
    value: T,
    accepted: AcceptFn,
}

/// Outcome of a send attempt against the channel state.
pub(crate) enum SendAttempt<T> {
    /// The value was handed to a receiver or buffered.
    Delivered,
    /// The value was parked in the pending-sender queue.
    Registered,
    /// No capacity and no waiting receiver; the value is handed back.
    Full(T),
}

struct ChannelState<T> {
    buffer: VecDeque<T>,
    blocked_sends: VecDeque<BlockedSend<T>>,
    blocked_receives: VecDeque<ReceiveCallback<T>>,
    closed: bool,
}

struct ChannelInner<T> {
    name: String,
    capacity: usize,
    state: Mutex<ChannelState<T>>,
}

/// A named FIFO channel with a fixed buffer capacity (0 = unbuffered).
///
/// Handles are cheap to clone and share one underlying queue. Sending on
/// a closed channel is fatal; receiving on a closed, drained channel
/// yields `(None, more = false)` forever.
pub struct Channel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Channel<T> {
    pub(crate) fn new(name: String, capacity: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name,
                capacity,
                state: Mutex::new(ChannelState {
                    buffer: VecDeque::new(),
                    blocked_sends: VecDeque::new(),
                    blocked_receives: VecDeque::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Human-readable channel name, used in blocking statuses and
    /// diagnostics.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Send a value, suspending the calling coroutine until a receiver
    /// takes it or buffer space frees up.
    ///
    /// # Panics
    ///
    /// Panics if the channel is closed, including when it is closed
    /// while the send is parked.
    pub fn send(&self, ctx: &WorkflowContext, value: T) {
        let state = ctx.coroutine_state();
        let consumed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&consumed);
        let accepted: AcceptFn = Box::new(move || {
            flag.store(true, Ordering::SeqCst);
            true
        });
        match self.send_async_impl(value, Some(accepted)) {
            SendAttempt::Delivered => {
                state.unblocked();
                return;
            }
            SendAttempt::Registered => {}
            SendAttempt::Full(_) => unreachable!("pending send was not registered"),
        }
        loop {
            // Close can land while the send is parked, so re-check it on
            // every resume, before the consumed flag.
            if self.is_closed() {
                panic!("send on closed channel {}", self.name());
            }
            if consumed.load(Ordering::SeqCst) {
                state.unblocked();
                return;
            }
            state.yield_now(&format!("blocked on {}.Send", self.name()));
        }
    }

    /// Non-blocking send. On failure the value is handed back in `Err`.
    ///
    /// # Panics
    ///
    /// Panics if the channel is closed.
    pub fn send_async(&self, value: T) -> Result<(), T> {
        match self.send_async_impl(value, None) {
            SendAttempt::Delivered => Ok(()),
            SendAttempt::Full(value) => Err(value),
            SendAttempt::Registered => unreachable!("async send never registers"),
        }
    }

    /// Receive a value, suspending the calling coroutine until one is
    /// available. Returns `None` once the channel is closed and drained.
    pub fn receive(&self, ctx: &WorkflowContext) -> Option<T> {
        self.receive_with_more_flag(ctx).0
    }

    /// Like [`Channel::receive`], additionally reporting whether more
    /// deliveries are possible (`false` once the channel is closed and
    /// drained).
    pub fn receive_with_more_flag(&self, ctx: &WorkflowContext) -> (Option<T>, bool) {
        let state = ctx.coroutine_state();
        let result: Arc<Mutex<Option<(Option<T>, bool)>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        let callback: ReceiveCallback<T> = Box::new(move |value, more| {
            *slot.lock() = Some((value, more));
            None
        });
        let (value, ok, more) = self.receive_async_impl(Some(callback));
        if ok || !more {
            return (value, more);
        }
        loop {
            if let Some(delivered) = result.lock().take() {
                state.unblocked();
                return delivered;
            }
            state.yield_now(&format!("blocked on {}.Receive", self.name()));
        }
    }

    /// Non-blocking receive.
    pub fn receive_async(&self) -> Option<T> {
        self.receive_async_with_more_flag().0
    }

    /// Non-blocking receive with the more flag.
    pub fn receive_async_with_more_flag(&self) -> (Option<T>, bool) {
        let (value, _, more) = self.receive_async_impl(None);
        (value, more)
    }

    /// Close the channel. Every blocked receiver is delivered
    /// `(None, more = false)` in order; every pending sender's accept
    /// callback is invoked so the sender observes the close and fails on
    /// its next resume.
    pub fn close(&self) {
        let (receivers, senders) = {
            let mut st = self.inner.state.lock();
            st.closed = true;
            (
                st.blocked_receives.drain(..).collect::<Vec<_>>(),
                st.blocked_sends.drain(..).collect::<Vec<_>>(),
            )
        };
        for mut callback in receivers {
            let _ = callback(None, false);
        }
        for mut send in senders {
            let _ = (send.accepted)();
        }
    }

    /// One delivery attempt. Returns `(value, ok, more)`: `ok` means a
    /// value was received, `more` means the channel is still open. When
    /// nothing is available and a callback is supplied, the callback is
    /// parked in the receiver queue.
    pub(crate) fn receive_async_impl(
        &self,
        callback: Option<ReceiveCallback<T>>,
    ) -> (Option<T>, bool, bool) {
        let mut st = self.inner.state.lock();
        if let Some(value) = st.buffer.pop_front() {
            return (Some(value), true, true);
        }
        if st.closed {
            return (None, false, false);
        }
        while let Some(mut send) = st.blocked_sends.pop_front() {
            if (send.accepted)() {
                return (Some(send.value), true, true);
            }
        }
        if let Some(callback) = callback {
            st.blocked_receives.push_back(callback);
        }
        (None, false, true)
    }

    /// One send attempt: offer to blocked receivers in order, then the
    /// buffer, then (when an accept callback is supplied) the
    /// pending-sender queue.
    pub(crate) fn send_async_impl(&self, value: T, pair: Option<AcceptFn>) -> SendAttempt<T> {
        let mut st = self.inner.state.lock();
        if st.closed {
            drop(st);
            panic!("send on closed channel {}", self.name());
        }
        let mut value = value;
        while let Some(mut callback) = st.blocked_receives.pop_front() {
            match callback(Some(value), true) {
                None => return SendAttempt::Delivered,
                Some(declined) => value = declined,
            }
        }
        if st.buffer.len() < self.inner.capacity {
            st.buffer.push_back(value);
            return SendAttempt::Delivered;
        }
        if let Some(accepted) = pair {
            st.blocked_sends.push_back(BlockedSend { value, accepted });
            return SendAttempt::Registered;
        }
        SendAttempt::Full(value)
    }

    #[cfg(test)]
    pub(crate) fn pending_receiver_count(&self) -> usize {
        self.inner.state.lock().blocked_receives.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_sender_count(&self) -> usize {
        self.inner.state.lock().blocked_sends.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn buffered(capacity: usize) -> Channel<i32> {
        Channel::new("chan-test".to_string(), capacity)
    }

    #[test]
    fn buffered_sends_are_delivered_in_fifo_order() {
        let ch = buffered(3);
        for v in [1, 2, 3] {
            ch.send_async(v).unwrap();
        }
        assert_eq!(ch.send_async(4), Err(4));
        assert_eq!(ch.receive_async(), Some(1));
        assert_eq!(ch.receive_async(), Some(2));
        assert_eq!(ch.receive_async(), Some(3));
        assert_eq!(ch.receive_async(), None);
    }

    #[test]
    fn unbuffered_async_send_fails_without_receiver() {
        let ch = buffered(0);
        assert_eq!(ch.send_async(7), Err(7));
    }

    #[test]
    fn drained_closed_channel_reports_no_more() {
        let ch = buffered(2);
        ch.send_async(1).unwrap();
        ch.close();
        assert_eq!(ch.receive_async_with_more_flag(), (Some(1), true));
        assert_eq!(ch.receive_async_with_more_flag(), (None, false));
        // Stays that way forever.
        assert_eq!(ch.receive_async_with_more_flag(), (None, false));
    }

    #[test]
    fn send_on_closed_channel_is_fatal() {
        let ch = buffered(1);
        ch.close();
        let result = catch_unwind(AssertUnwindSafe(|| ch.send_async(1)));
        assert!(result.is_err());
    }

    #[test]
    fn registered_receive_callback_gets_the_next_value() {
        let ch = buffered(0);
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let callback: ReceiveCallback<i32> = Box::new(move |v, more| {
            *slot.lock() = Some((v, more));
            None
        });
        let (_, ok, more) = ch.receive_async_impl(Some(callback));
        assert!(!ok && more);
        ch.send_async(9).unwrap();
        assert_eq!(*seen.lock(), Some((Some(9), true)));
        assert_eq!(ch.pending_receiver_count(), 0);
    }

    #[test]
    fn declined_delivery_is_offered_to_the_next_receiver() {
        let ch = buffered(0);
        let decliner: ReceiveCallback<i32> = Box::new(|v, _more| v);
        let taken = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&taken);
        let taker: ReceiveCallback<i32> = Box::new(move |v, _more| {
            *slot.lock() = v;
            None
        });
        ch.receive_async_impl(Some(decliner));
        ch.receive_async_impl(Some(taker));
        ch.send_async(5).unwrap();
        assert_eq!(*taken.lock(), Some(5));
    }

    #[test]
    fn close_delivers_no_more_to_blocked_receivers_in_order() {
        let ch = buffered(0);
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..2 {
            let log = Arc::clone(&log);
            let callback: ReceiveCallback<i32> = Box::new(move |v, more| {
                log.lock().push((id, v.is_none(), more));
                None
            });
            ch.receive_async_impl(Some(callback));
        }
        ch.close();
        assert_eq!(*log.lock(), vec![(0, true, false), (1, true, false)]);
    }
}

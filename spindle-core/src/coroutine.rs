//! Coroutine handoff primitive.
//!
//! Every cooperative task owns a host thread but runs only while the
//! dispatcher hands it the baton. Control moves through a pair of
//! single-slot rendezvous channels per task: the dispatcher pushes an
//! unblock function into `unblock` and waits on `about_to_block`; the
//! task signals `about_to_block` when it is about to suspend and then
//! waits for the next unblock function. Exactly one side is runnable at
//! any instant, so the shared state below needs no ordering subtler than
//! the channel handoffs themselves.

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, Weak};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::dispatcher::DispatcherCore;
use crate::error::PanicError;

/// Evaluated by a suspended coroutine when the dispatcher pokes it.
///
/// Returning `false` resumes the coroutine. Returning `true` keeps it
/// suspended, which lets the dispatcher run purely observational
/// unblocks (stack collection) against a live task. `status` is the
/// blocking reason recorded by the suspending call; `stack_depth` is the
/// number of additional leading frames to drop from a captured trace.
pub(crate) type UnblockFn = Box<dyn FnOnce(&str, usize) -> bool + Send>;

/// Unwind payload used to terminate a coroutine host thread when the
/// dispatcher is closed while tasks are still live. The coroutine
/// boundary recognizes it and finishes the thread without recording a
/// panic.
pub(crate) struct TerminateCoroutine;

thread_local! {
    static IN_COROUTINE: Cell<bool> = const { Cell::new(false) };
    static LAST_PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Install the process-wide panic hook that captures a backtrace for
/// panics on coroutine threads and suppresses their default stderr
/// report (the dispatcher re-surfaces them as [`PanicError`]s). Panics
/// on other threads keep the previous hook's behavior.
pub(crate) fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if IN_COROUTINE.get() {
                LAST_PANIC_TRACE
                    .set(Some(Backtrace::force_capture().to_string()));
            } else {
                previous(info);
            }
        }));
    });
}

pub(crate) fn mark_coroutine_thread() {
    IN_COROUTINE.set(true);
}

pub(crate) fn take_last_panic_trace() -> Option<String> {
    LAST_PANIC_TRACE.take()
}

/// Per-coroutine state shared between the owning task and the
/// dispatcher. Both rendezvous endpoints live here; each side only ever
/// uses its own pair, and the struct keeps the channels connected for
/// the lifetime of the coroutine.
pub(crate) struct CoroutineState {
    name: String,
    dispatcher: Weak<DispatcherCore>,
    about_to_block_tx: Sender<bool>,
    about_to_block_rx: Receiver<bool>,
    unblock_tx: Sender<UnblockFn>,
    unblock_rx: Receiver<UnblockFn>,
    kept_blocked: AtomicBool,
    closed: AtomicBool,
    panic_error: Mutex<Option<PanicError>>,
}

impl CoroutineState {
    pub(crate) fn new(name: String, dispatcher: Weak<DispatcherCore>) -> Self {
        let (about_to_block_tx, about_to_block_rx) = bounded(1);
        let (unblock_tx, unblock_rx) = bounded(0);
        Self {
            name,
            dispatcher,
            about_to_block_tx,
            about_to_block_rx,
            unblock_tx,
            unblock_rx,
            kept_blocked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            panic_error: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn dispatcher(&self) -> Arc<DispatcherCore> {
        match self.dispatcher.upgrade() {
            Some(core) => core,
            None => panic!("coroutine outlived its dispatcher"),
        }
    }

    /// Wait for unblock functions until one of them asks to resume.
    /// Called at the top of every coroutine before any user code runs,
    /// and again from [`CoroutineState::yield_now`] at each suspension
    /// point.
    pub(crate) fn initial_yield(&self, stack_depth: usize, status: &str) {
        let mut keep_blocked = true;
        while keep_blocked {
            let f = match self.unblock_rx.recv() {
                Ok(f) => f,
                // The dispatcher endpoint can only vanish if the whole
                // runtime is being torn down; finish the thread quietly.
                Err(_) => panic::panic_any(TerminateCoroutine),
            };
            keep_blocked = f(status, stack_depth);
        }
    }

    /// Suspend the coroutine, recording `status` as the blocking reason.
    /// Returns once the dispatcher resumes the task.
    pub(crate) fn yield_now(&self, status: &str) {
        let _ = self.about_to_block_tx.send(true);
        self.initial_yield(0, status);
        self.kept_blocked.store(true, Ordering::SeqCst);
    }

    /// Mark that the coroutine made progress since its last suspension
    /// (a channel op completed or a selector fired).
    pub(crate) fn unblocked(&self) {
        self.kept_blocked.store(false, Ordering::SeqCst);
    }

    pub(crate) fn kept_blocked(&self) -> bool {
        self.kept_blocked.load(Ordering::SeqCst)
    }

    /// Dispatcher side: resume the coroutine and wait until it suspends
    /// again or finishes.
    pub(crate) fn call(&self) {
        let _ = self.unblock_tx.send(Box::new(|_status, _depth| false));
        let _ = self.about_to_block_rx.recv();
    }

    /// Coroutine side: mark the task finished and release the
    /// dispatcher if it is waiting inside [`CoroutineState::call`].
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.about_to_block_tx.send(true);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Dispatcher side: terminate the host thread of a live coroutine.
    /// The task unwinds out of its suspension point and must not run
    /// any further user code.
    pub(crate) fn exit(&self) {
        if !self.is_closed() {
            let _ = self.unblock_tx.send(Box::new(|_status, _depth| -> bool {
                panic::panic_any(TerminateCoroutine)
            }));
        }
    }

    /// Dispatcher side: capture the stack of a live, suspended
    /// coroutine without resuming it.
    pub(crate) fn stack_trace(&self) -> Option<String> {
        if self.is_closed() {
            return None;
        }
        let (trace_tx, trace_rx) = bounded(1);
        let name = self.name.clone();
        let _ = self.unblock_tx.send(Box::new(move |status, stack_depth| {
            let _ = trace_tx.send(capture_stack_trace(&name, status, stack_depth));
            true
        }));
        trace_rx.recv().ok()
    }

    pub(crate) fn record_panic(&self, error: PanicError) {
        *self.panic_error.lock() = Some(error);
    }

    pub(crate) fn panic_error(&self) -> Option<PanicError> {
        self.panic_error.lock().clone()
    }
}

/// Symbol fragments identifying frames internal to the runtime or the
/// standard library's unwind machinery; these are dropped from coroutine
/// stack traces so the top frames point at user workflow code.
const RUNTIME_FRAME_MARKERS: &[&str] = &[
    "spindle_core::",
    "spindle_runtime::",
    "std::",
    "core::panicking",
    "core::ops::function",
    "alloc::boxed",
    "backtrace::",
    "rust_begin_unwind",
    "__rust",
    "___rust",
    "start_thread",
];

/// Capture the current thread's stack, headed
/// `coroutine <name> [<status>]:`, with runtime frames removed.
pub(crate) fn capture_stack_trace(name: &str, status: &str, stack_depth: usize) -> String {
    let raw = Backtrace::force_capture().to_string();
    clean_stack_trace(name, status, &raw, stack_depth)
}

/// Trim a raw backtrace down to user frames. `skip` additionally drops
/// that many leading frames that survived the marker filter.
pub(crate) fn clean_stack_trace(name: &str, status: &str, raw: &str, skip: usize) -> String {
    let mut frames: Vec<Vec<&str>> = Vec::new();
    for line in raw.lines() {
        if is_frame_header(line) {
            frames.push(vec![line]);
        } else if let Some(frame) = frames.last_mut() {
            frame.push(line);
        }
    }

    let mut out = format!("coroutine {name} [{status}]:");
    for frame in frames
        .iter()
        .filter(|frame| !is_runtime_frame(frame[0]))
        .skip(skip)
    {
        for line in frame {
            out.push('\n');
            out.push_str(line);
        }
    }
    out
}

fn is_frame_header(line: &str) -> bool {
    let trimmed = line.trim_start();
    let Some((index, _)) = trimmed.split_once(": ") else {
        return false;
    };
    !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit())
}

fn is_runtime_frame(header: &str) -> bool {
    RUNTIME_FRAME_MARKERS
        .iter()
        .any(|marker| header.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "   0: std::backtrace::Backtrace::force_capture\n             at /rustc/lib/std/src/backtrace.rs:331:9\n   1: spindle_core::coroutine::capture_stack_trace\n             at ./src/coroutine.rs:10:5\n   2: my_workflow::transfer_funds\n             at ./src/main.rs:42:13\n   3: std::sys::backtrace::__rust_begin_short_backtrace\n             at /rustc/lib/std/src/sys/backtrace.rs:152:18\n";

    #[test]
    fn clean_stack_trace_keeps_only_user_frames() {
        let cleaned = clean_stack_trace("7", "blocked on chan-1.Receive", RAW, 0);
        let mut lines = cleaned.lines();
        assert_eq!(
            lines.next(),
            Some("coroutine 7 [blocked on chan-1.Receive]:")
        );
        assert!(cleaned.contains("my_workflow::transfer_funds"));
        assert!(!cleaned.contains("spindle_core::"));
        assert!(!cleaned.contains("std::"));
    }

    #[test]
    fn clean_stack_trace_skips_extra_leading_frames() {
        let cleaned = clean_stack_trace("1", "panic", RAW, 1);
        assert_eq!(cleaned, "coroutine 1 [panic]:");
    }

    #[test]
    fn frame_headers_are_detected() {
        assert!(is_frame_header("   3: std::rt::lang_start"));
        assert!(!is_frame_header("             at ./src/main.rs:42:13"));
        assert!(!is_frame_header("thread 'main' panicked"));
    }
}

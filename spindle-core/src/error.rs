//! Error types for spindle-core.
//!
//! Recoverable failures travel as `anyhow::Result` at user boundaries.
//! Fatal conditions (send on a closed channel, double-setting a future,
//! dispatcher misuse) are raised as panics and captured at the coroutine
//! boundary into a [`PanicError`].

use std::any::Any;
use std::sync::Arc;

/// An error shared between a future and every future chained to it.
///
/// Completion cascades hand the same error value to each downstream
/// future, so it is reference-counted rather than cloned.
pub type SharedError = Arc<anyhow::Error>;

/// Result flavor produced by futures.
pub type SharedResult<T> = Result<T, SharedError>;

/// A panic captured at a coroutine boundary.
///
/// Carries the panic message together with a stack trace of the
/// panicking coroutine, trimmed of runtime-internal frames. The
/// dispatcher surfaces the first captured panic per pass; the root
/// driver reports it to the environment as a workflow failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct PanicError {
    message: String,
    stack_trace: String,
}

impl PanicError {
    pub(crate) fn new(message: impl Into<String>, stack_trace: String) -> Self {
        Self {
            message: message.into(),
            stack_trace,
        }
    }

    /// The panic payload rendered as a message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stack trace of the panicking coroutine.
    pub fn stack_trace(&self) -> &str {
        &self.stack_trace
    }
}

/// Render a panic payload the way the default runtime hook does:
/// `&str` and `String` payloads verbatim, anything else a placeholder.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

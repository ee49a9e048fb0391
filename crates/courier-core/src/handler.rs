//! Handling actions and failure reporting.
//!
//! The dispatcher depends on its handling action only through
//! [`MessageHandler`]. Panics raised by a handler are caught at the dispatch
//! boundary and passed to a [`FailureSink`].

use std::any::Any;
use std::io::Write;

use crate::message::{DispatchPath, Message};

/// The side-effecting step run once per dispatched message.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle a message. Called on the consumer thread for urgent messages
    /// and on a worker thread for normal ones.
    fn handle(&self, message: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    fn handle(&self, message: &Message) {
        self(message)
    }
}

/// Format the line both built-in handlers emit.
pub fn describe(message: &Message) -> String {
    if message.is_urgent() {
        format!("Handling urgent message {}", message)
    } else {
        format!("Handling message {}", message)
    }
}

/// Handler that logs every message at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

impl MessageHandler for LogHandler {
    fn handle(&self, message: &Message) {
        log::info!("{}", describe(message));
    }
}

/// Handler that prints every message to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutHandler;

impl MessageHandler for StdoutHandler {
    fn handle(&self, message: &Message) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let _ = writeln!(out, "{}", describe(message));
    }
}

/// A handler panic caught at the dispatch boundary.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub seq: u64,
    pub path: DispatchPath,
    pub message: Message,
    /// The panic payload rendered as text.
    pub reason: String,
}

impl HandlerFailure {
    pub(crate) fn from_panic(
        seq: u64,
        path: DispatchPath,
        message: Message,
        payload: Box<dyn Any + Send>,
    ) -> Self {
        Self {
            seq,
            path,
            message,
            reason: panic_reason(payload.as_ref()),
        }
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Receives handler failures.
pub trait FailureSink: Send + Sync + 'static {
    fn report(&self, failure: &HandlerFailure);
}

impl<F> FailureSink for F
where
    F: Fn(&HandlerFailure) + Send + Sync + 'static,
{
    fn report(&self, failure: &HandlerFailure) {
        self(failure)
    }
}

/// Default sink: logs the failure at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFailureSink;

impl FailureSink for LogFailureSink {
    fn report(&self, failure: &HandlerFailure) {
        log::error!(
            "[DISPATCH] {} handler failed for #{} ({}): {}",
            failure.path,
            failure.seq,
            failure.message,
            failure.reason
        );
    }
}

//! Observation events emitted by the dispatcher.
//!
//! Events are only produced when a sender was supplied through
//! [`DispatcherBuilder::event_sink`](crate::DispatcherBuilder::event_sink).
//! Nothing in the dispatcher waits on them: events that do not fit in a
//! bounded sink are dropped.

use crate::message::DispatchPath;

/// Something that happened to a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    /// The consumer removed the message from the queue.
    Popped { seq: u64, path: DispatchPath },
    /// The handler returned normally.
    Handled { seq: u64, path: DispatchPath },
    /// The handler panicked.
    Failed { seq: u64, path: DispatchPath },
    /// The message was discarded without being handled.
    Dropped { seq: u64 },
    /// The consumer thread exited and the normal executor is shut down.
    Stopped,
}

impl DispatchEvent {
    /// Sequence number of the message this event concerns.
    pub fn seq(&self) -> Option<u64> {
        match *self {
            DispatchEvent::Popped { seq, .. }
            | DispatchEvent::Handled { seq, .. }
            | DispatchEvent::Failed { seq, .. }
            | DispatchEvent::Dropped { seq } => Some(seq),
            DispatchEvent::Stopped => None,
        }
    }
}

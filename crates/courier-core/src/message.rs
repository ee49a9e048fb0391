//! Message model.
//!
//! A [`Message`] is an immutable value: once posted it is moved into the
//! queue and moved out again exactly once by the consumer.

use std::fmt;
use std::time::Instant;

/// Which handling strategy a message takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchPath {
    /// Handled inline on the consumer thread.
    Urgent,
    /// Handed to the normal-path executor with an induced delay.
    Normal,
}

impl fmt::Display for DispatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchPath::Urgent => write!(f, "urgent"),
            DispatchPath::Normal => write!(f, "normal"),
        }
    }
}

/// A transient message routed by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sender: String,
    recipient: String,
    body: String,
    urgent: bool,
}

impl Message {
    /// Create a new message.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<String>,
        urgent: bool,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            body: body.into(),
            urgent,
        }
    }

    /// Shorthand for an urgent message.
    pub fn urgent(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::new(sender, recipient, body, true)
    }

    /// Shorthand for a normal message.
    pub fn normal(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::new(sender, recipient, body, false)
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn is_urgent(&self) -> bool {
        self.urgent
    }

    /// The handling strategy selected by the urgency flag.
    pub fn path(&self) -> DispatchPath {
        if self.urgent {
            DispatchPath::Urgent
        } else {
            DispatchPath::Normal
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "from {} to {}: {}", self.sender, self.recipient, self.body)
    }
}

/// A queued message together with its position in the queue.
#[derive(Debug)]
pub(crate) struct Envelope {
    /// Assigned under the queue lock, so seq order is FIFO order.
    pub seq: u64,
    pub message: Message,
    pub posted_at: Instant,
}

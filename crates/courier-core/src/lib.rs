//! Courier Core - an in-process message dispatcher.
//!
//! A single background consumer thread drains a shared queue and routes each
//! message by its urgency flag:
//!
//! - **Urgent** messages are handled inline on the consumer thread, in FIFO
//!   order, before the consumer moves on
//! - **Normal** messages are handed to a worker pool (or, opt-in, a detached
//!   thread per message) and handled after a fixed delay, in no particular
//!   order
//!
//! # Architecture
//!
//! Producers post through [`Dispatcher`] or a cloned [`DispatcherHandle`].
//! The handling action is supplied as a [`MessageHandler`]; handler panics
//! are caught and passed to a [`FailureSink`]. Delivery is best-effort and
//! at-most-once: what happens to pending work at shutdown is chosen by
//! [`ShutdownPolicy`].
//!
//! ```no_run
//! use courier_core::{Dispatcher, LogHandler};
//!
//! let dispatcher = Dispatcher::new(LogHandler)?;
//! dispatcher.post("alice", "bob", "hi", false)?;
//! dispatcher.post("carol", "dave", "fire", true)?;
//! let report = dispatcher.shutdown();
//! println!("{} handled", report.stats.handled());
//! # Ok::<(), courier_core::Error>(())
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handler;
pub mod message;

// Re-export main types
pub use config::{Config, NormalMode, OverflowPolicy, ShutdownPolicy};
pub use dispatcher::{Dispatcher, DispatcherBuilder, DispatcherHandle, DispatcherStats, ShutdownReport};
pub use error::{Error, Result};
pub use events::DispatchEvent;
pub use handler::{
    FailureSink, HandlerFailure, LogFailureSink, LogHandler, MessageHandler, StdoutHandler,
};
pub use message::{DispatchPath, Message};

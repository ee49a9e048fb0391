//! The dispatcher.
//!
//! The dispatcher manages:
//! - The shared message queue and its condition variables
//! - The consumer thread draining the queue
//! - The normal-path executor (worker pool or detached threads)
//! - Shutdown of all of the above

mod context;
mod queue;
mod stats;
pub mod thread;
mod worker;

pub use stats::DispatcherStats;
pub use thread::{Dispatcher, DispatcherBuilder, DispatcherHandle, ShutdownReport};

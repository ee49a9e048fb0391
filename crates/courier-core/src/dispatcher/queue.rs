//! The shared message queue.
//!
//! Queue contents, the running flag and the sequence counter live behind a
//! single mutex. `not_empty` wakes the consumer, `not_full` wakes producers
//! blocked on a bounded queue.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::stats::Counters;
use crate::config::{OverflowPolicy, QueueSettings, ShutdownPolicy};
use crate::error::{Error, Result};
use crate::message::{Envelope, Message};

struct QueueState {
    items: VecDeque<Envelope>,
    running: bool,
    next_seq: u64,
}

pub(crate) struct SharedQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
}

impl SharedQueue {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                running: true,
                next_seq: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: settings.capacity,
            overflow: settings.overflow,
        }
    }

    // Handlers never run under this lock, so a poisoned guard still holds
    // consistent queue state.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message and wake the consumer. Returns its sequence number.
    ///
    /// `posted` is counted under the lock, so it is always visible before the
    /// consumer can pop the message.
    pub fn push(&self, message: Message, counters: &Counters) -> Result<u64> {
        let mut state = self.lock();
        loop {
            if !state.running {
                return Err(Error::Closed);
            }
            match self.capacity {
                Some(capacity) if state.items.len() >= capacity => match self.overflow {
                    OverflowPolicy::Reject => return Err(Error::QueueSaturated { capacity }),
                    OverflowPolicy::Block => {
                        state = self
                            .not_full
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                },
                _ => break,
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        counters.record_posted();
        state.items.push_back(Envelope {
            seq,
            message,
            posted_at: Instant::now(),
        });
        drop(state);

        self.not_empty.notify_one();
        Ok(seq)
    }

    /// Block until a message is available or the queue is closed.
    ///
    /// Once closed, `Drain` keeps returning queued messages until none are
    /// left; `Discard` returns `None` straight away.
    pub fn pop(&self, policy: ShutdownPolicy) -> Option<Envelope> {
        let mut state = self.lock();
        loop {
            if !state.running && policy == ShutdownPolicy::Discard {
                return None;
            }
            if let Some(envelope) = state.items.pop_front() {
                drop(state);
                if self.capacity.is_some() {
                    self.not_full.notify_one();
                }
                return Some(envelope);
            }
            if !state.running {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Clear the running flag and wake everyone waiting on the queue.
    ///
    /// Returns `false` if the queue was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        let was_running = std::mem::replace(&mut state.running, false);
        drop(state);

        self.not_empty.notify_one();
        self.not_full.notify_all();
        was_running
    }

    /// Remove everything still queued.
    pub fn take_remaining(&self) -> Vec<Envelope> {
        let mut state = self.lock();
        state.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }
}

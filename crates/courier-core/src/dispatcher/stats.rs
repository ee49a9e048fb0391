//! Dispatcher counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::message::DispatchPath;

/// Point-in-time snapshot of dispatcher activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Messages accepted by `post`.
    pub posted: u64,
    /// Posts refused because the queue was full or closed.
    pub rejected: u64,
    /// Messages removed from the queue by the consumer.
    pub popped: u64,
    pub urgent_handled: u64,
    pub normal_handled: u64,
    /// Handler panics.
    pub failed: u64,
    /// Messages discarded without being handled.
    pub dropped: u64,
    /// Messages currently waiting in the queue.
    pub queued: usize,
    /// Normal messages handed off but not yet finished.
    pub in_flight: usize,
}

impl DispatcherStats {
    /// Messages whose handler ran, successfully or not.
    pub fn handled(&self) -> u64 {
        self.urgent_handled + self.normal_handled + self.failed
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    posted: AtomicU64,
    rejected: AtomicU64,
    popped: AtomicU64,
    urgent_handled: AtomicU64,
    normal_handled: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    in_flight: AtomicUsize,
}

impl Counters {
    pub fn record_posted(&self) {
        self.posted.fetch_add(1, Ordering::Release);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_popped(&self) {
        self.popped.fetch_add(1, Ordering::Release);
    }

    pub fn record_handled(&self, path: DispatchPath) {
        match path {
            DispatchPath::Urgent => self.urgent_handled.fetch_add(1, Ordering::Relaxed),
            DispatchPath::Normal => self.normal_handled.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn begin_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_in_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self, queued: usize) -> DispatcherStats {
        // Read popped before posted so a snapshot never shows popped > posted.
        let popped = self.popped.load(Ordering::Acquire);
        DispatcherStats {
            posted: self.posted.load(Ordering::Acquire),
            rejected: self.rejected.load(Ordering::Relaxed),
            popped,
            urgent_handled: self.urgent_handled.load(Ordering::Relaxed),
            normal_handled: self.normal_handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            queued,
            in_flight: self.in_flight.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = Counters::default();
        counters.record_posted();
        counters.record_posted();
        counters.record_popped();
        counters.record_handled(DispatchPath::Urgent);
        counters.record_handled(DispatchPath::Normal);
        counters.record_failed();
        counters.record_dropped(3);
        counters.begin_in_flight();
        counters.begin_in_flight();
        counters.end_in_flight();

        let stats = counters.snapshot(5);
        assert_eq!(stats.posted, 2);
        assert_eq!(stats.popped, 1);
        assert_eq!(stats.urgent_handled, 1);
        assert_eq!(stats.normal_handled, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.queued, 5);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.handled(), 3);
    }
}

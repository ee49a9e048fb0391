//! Dispatcher and its consumer thread.
//!
//! The consumer thread is the heart of courier. It:
//! - Waits on the shared queue while it is empty
//! - Pops one message at a time in FIFO order
//! - Handles urgent messages inline
//! - Hands normal messages to the normal-path executor

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use super::context::DispatchContext;
use super::queue::SharedQueue;
use super::stats::DispatcherStats;
use super::worker::NormalExecutor;
use crate::config::{Config, NormalMode, OverflowPolicy, ShutdownPolicy};
use crate::error::{Error, Result};
use crate::events::DispatchEvent;
use crate::handler::{FailureSink, LogFailureSink, LogHandler, MessageHandler};
use crate::message::{DispatchPath, Message};

/// Cloneable producer handle.
///
/// This is what producer threads hold. It shares the queue with its
/// [`Dispatcher`] but does not keep the consumer thread alive.
#[derive(Clone)]
pub struct DispatcherHandle {
    queue: Arc<SharedQueue>,
    ctx: Arc<DispatchContext>,
}

impl DispatcherHandle {
    /// Post a message built from its parts.
    pub fn post(
        &self,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<String>,
        urgent: bool,
    ) -> Result<()> {
        self.post_message(Message::new(sender, recipient, body, urgent))
    }

    /// Append a message to the queue and wake the consumer.
    ///
    /// Fails only with [`Error::Closed`](crate::Error::Closed) after shutdown
    /// or [`Error::QueueSaturated`](crate::Error::QueueSaturated) when a
    /// bounded queue rejects it.
    pub fn post_message(&self, message: Message) -> Result<()> {
        let path = message.path();
        match self.queue.push(message, &self.ctx.counters) {
            Ok(seq) => {
                log::trace!("[DISPATCH] posted #{} ({})", seq, path);
                Ok(())
            }
            Err(e) => {
                self.ctx.counters.record_rejected();
                log::debug!("[DISPATCH] rejected {} message: {}", path, e);
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.ctx.counters.snapshot(self.queue.len())
    }

    /// Whether the dispatcher still accepts messages.
    pub fn is_running(&self) -> bool {
        self.queue.is_running()
    }
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("running", &self.is_running())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

/// Outcome of [`Dispatcher::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Counters after the consumer thread exited.
    pub stats: DispatcherStats,
    /// Messages still queued that were discarded by this shutdown.
    pub discarded: usize,
    /// Time spent stopping. Zero when the dispatcher was already stopped.
    pub elapsed: Duration,
}

/// The message dispatcher.
///
/// Starts its consumer thread on construction and stops it on
/// [`shutdown`](Self::shutdown) or drop.
pub struct Dispatcher {
    handle: DispatcherHandle,
    policy: ShutdownPolicy,
    /// Join handle for the consumer thread; `None` once stopped.
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start a dispatcher with the default configuration.
    pub fn new(handler: impl MessageHandler) -> Result<Self> {
        Self::builder().handler(handler).start()
    }

    /// Start a dispatcher with the given configuration.
    pub fn with_config(config: Config, handler: impl MessageHandler) -> Result<Self> {
        Self::builder().config(config).handler(handler).start()
    }

    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Get a producer handle that can be cloned into other threads.
    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Post a message built from its parts. See [`DispatcherHandle::post`].
    pub fn post(
        &self,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<String>,
        urgent: bool,
    ) -> Result<()> {
        self.handle.post(sender, recipient, body, urgent)
    }

    /// Post a prepared message. See [`DispatcherHandle::post_message`].
    pub fn post_message(&self, message: Message) -> Result<()> {
        self.handle.post_message(message)
    }

    pub fn stats(&self) -> DispatcherStats {
        self.handle.stats()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        self.policy
    }

    /// Stop the consumer thread and the normal executor.
    ///
    /// Blocks until the consumer has exited. Concurrent and repeated calls
    /// are safe; later calls wait for the first to finish and return the
    /// final counters.
    pub fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();
        let mut consumer = self.consumer.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(thread) = consumer.take() else {
            return ShutdownReport {
                stats: self.stats(),
                discarded: 0,
                elapsed: Duration::ZERO,
            };
        };

        log::debug!("[DISPATCH] shutting down ({:?})", self.policy);
        self.handle.queue.close();
        if thread.join().is_err() {
            log::error!("[DISPATCH] consumer thread panicked");
        }

        let remaining = self.handle.queue.take_remaining();
        if !remaining.is_empty() {
            log::warn!(
                "[DISPATCH] discarding {} queued message(s) on shutdown",
                remaining.len()
            );
        }
        for envelope in &remaining {
            self.handle.ctx.drop_message(envelope.seq);
        }
        self.handle.ctx.emit(DispatchEvent::Stopped);

        let report = ShutdownReport {
            stats: self.stats(),
            discarded: remaining.len(),
            elapsed: started.elapsed(),
        };
        log::info!(
            "[DISPATCH] stopped after {:?}: {} posted, {} handled, {} failed, {} dropped",
            report.elapsed,
            report.stats.posted,
            report.stats.handled(),
            report.stats.failed,
            report.stats.dropped
        );
        report
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    config: Config,
    handler: Arc<dyn MessageHandler>,
    failure_sink: Arc<dyn FailureSink>,
    events: Option<Sender<DispatchEvent>>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            handler: Arc::new(LogHandler),
            failure_sink: Arc::new(LogFailureSink),
            events: None,
        }
    }
}

impl DispatcherBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn handler(mut self, handler: impl MessageHandler) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn failure_sink(mut self, sink: impl FailureSink) -> Self {
        self.failure_sink = Arc::new(sink);
        self
    }

    /// Receive a [`DispatchEvent`] for every step a message goes through.
    pub fn event_sink(mut self, tx: Sender<DispatchEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Latency applied before each normal message is handled.
    pub fn normal_delay(mut self, delay: Duration) -> Self {
        self.config.normal.delay = delay;
        self
    }

    /// Use a pool of `workers` threads for normal messages.
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.normal.mode = NormalMode::Pool;
        self.config.normal.workers = workers;
        self
    }

    /// Spawn one untracked thread per normal message.
    pub fn detached(mut self) -> Self {
        self.config.normal.mode = NormalMode::Detached;
        self
    }

    /// Bound the queue to `capacity` pending messages.
    pub fn capacity(mut self, capacity: usize, overflow: OverflowPolicy) -> Self {
        self.config.queue.capacity = Some(capacity);
        self.config.queue.overflow = overflow;
        self
    }

    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.config.shutdown.policy = policy;
        self
    }

    /// Validate the configuration and start the consumer thread.
    pub fn start(self) -> Result<Dispatcher> {
        let config = self.config;
        config.validate()?;

        let ctx = Arc::new(DispatchContext::new(
            self.handler,
            self.failure_sink,
            self.events,
        ));
        let queue = Arc::new(SharedQueue::new(&config.queue));
        let policy = config.shutdown.policy;

        let executor = NormalExecutor::start(&config.normal, &config.thread_name, ctx.clone())?;

        let consumer = ConsumerThread {
            queue: queue.clone(),
            ctx: ctx.clone(),
            executor,
            policy,
        };
        let thread = thread::Builder::new()
            .name(format!("{}-consumer", config.thread_name))
            .spawn(move || consumer.run())
            .map_err(Error::Spawn)?;

        log::debug!(
            "[DISPATCH] consumer started ({:?} normal executor, capacity {:?})",
            config.normal.mode,
            config.queue.capacity
        );

        Ok(Dispatcher {
            handle: DispatcherHandle { queue, ctx },
            policy,
            consumer: Mutex::new(Some(thread)),
        })
    }
}

/// The consumer side of the dispatcher. Owns the normal executor.
struct ConsumerThread {
    queue: Arc<SharedQueue>,
    ctx: Arc<DispatchContext>,
    executor: NormalExecutor,
    policy: ShutdownPolicy,
}

impl ConsumerThread {
    fn run(mut self) {
        while let Some(envelope) = self.queue.pop(self.policy) {
            let seq = envelope.seq;
            let path = envelope.message.path();
            self.ctx.counters.record_popped();
            self.ctx.emit(DispatchEvent::Popped { seq, path });
            log::debug!(
                "[DISPATCH] popped #{} ({}) after {:?} queued",
                seq,
                path,
                envelope.posted_at.elapsed()
            );

            match path {
                DispatchPath::Urgent => self.ctx.handle(seq, &envelope.message, path),
                DispatchPath::Normal => self.executor.submit(seq, envelope.message),
            }
        }

        self.executor.shutdown(self.policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerFailure;
    use crossbeam_channel::{unbounded, Receiver};
    use std::collections::HashMap;

    const WAIT: Duration = Duration::from_secs(5);

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording_handler(log: Log) -> impl MessageHandler {
        move |m: &Message| log.lock().unwrap().push(m.body().to_string())
    }

    fn recv_until<F>(rx: &Receiver<DispatchEvent>, mut done: F) -> Vec<DispatchEvent>
    where
        F: FnMut(&[DispatchEvent]) -> bool,
    {
        let mut events = Vec::new();
        while !done(&events) {
            events.push(rx.recv_timeout(WAIT).expect("timed out waiting for dispatch events"));
        }
        events
    }

    fn count_handled(events: &[DispatchEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, DispatchEvent::Handled { .. }))
            .count()
    }

    #[test]
    fn test_pop_order_matches_post_order() {
        let (tx, rx) = unbounded();
        let dispatcher = Dispatcher::builder()
            .event_sink(tx)
            .normal_delay(Duration::ZERO)
            .build_quiet();

        for i in 0..20 {
            dispatcher.post("p", "c", i.to_string(), i % 3 == 0).unwrap();
        }
        let events = recv_until(&rx, |events| count_handled(events) == 20);

        let popped: Vec<u64> = events
            .iter()
            .filter(|e| matches!(e, DispatchEvent::Popped { .. }))
            .filter_map(DispatchEvent::seq)
            .collect();
        assert_eq!(popped, (0..20u64).collect::<Vec<_>>());

        dispatcher.shutdown();
        let stopped = recv_until(&rx, |events| events.contains(&DispatchEvent::Stopped));
        assert_eq!(stopped.last().and_then(DispatchEvent::seq), None);
    }

    #[test]
    fn test_urgent_messages_are_serialized() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let handler_log = log.clone();
        let dispatcher = Dispatcher::builder()
            .handler(move |m: &Message| {
                handler_log.lock().unwrap().push(format!("start {}", m.body()));
                thread::sleep(Duration::from_millis(20));
                handler_log.lock().unwrap().push(format!("end {}", m.body()));
            })
            .shutdown_policy(ShutdownPolicy::Drain)
            .build_quiet();

        for i in 0..5 {
            dispatcher.post("a", "b", i.to_string(), true).unwrap();
        }
        let report = dispatcher.shutdown();
        assert_eq!(report.stats.urgent_handled, 5);

        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("start {}", i), format!("end {}", i)])
            .collect();
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[test]
    fn test_normal_delay_does_not_block_consumer() {
        let (tx, rx) = unbounded();
        let dispatcher = Dispatcher::builder()
            .event_sink(tx)
            .normal_delay(Duration::from_millis(300))
            .build_quiet();

        dispatcher.post("a", "b", "k", false).unwrap();
        dispatcher.post("a", "b", "k+1", false).unwrap();

        let events = recv_until(&rx, |events| count_handled(events) == 2);
        let position = |wanted: DispatchEvent| events.iter().position(|e| *e == wanted).unwrap();
        let popped_next = position(DispatchEvent::Popped { seq: 1, path: DispatchPath::Normal });
        let handled_first = position(DispatchEvent::Handled { seq: 0, path: DispatchPath::Normal });
        assert!(popped_next < handled_first);
    }

    #[test]
    fn test_urgent_overtakes_delayed_normal() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = unbounded();
        let dispatcher = Dispatcher::builder()
            .handler(recording_handler(log.clone()))
            .event_sink(tx)
            .normal_delay(Duration::from_millis(200))
            .build_quiet();

        dispatcher.post("alice", "bob", "hi", false).unwrap();
        dispatcher.post("carol", "dave", "fire", true).unwrap();

        recv_until(&rx, |events| count_handled(events) == 2);
        assert_eq!(*log.lock().unwrap(), vec!["fire".to_string(), "hi".to_string()]);
    }

    #[test]
    fn test_concurrent_producers_deliver_exactly_once() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::builder()
            .handler(recording_handler(log.clone()))
            .shutdown_policy(ShutdownPolicy::Drain)
            .build_quiet();

        thread::scope(|scope| {
            for producer in 0..4 {
                let handle = dispatcher.handle();
                scope.spawn(move || {
                    for i in 0..25 {
                        let body = format!("{}:{}", producer, i);
                        handle.post(format!("p{}", producer), "c", body, true).unwrap();
                    }
                });
            }
        });

        let report = dispatcher.shutdown();
        assert_eq!(report.stats.posted, 100);
        assert_eq!(report.stats.urgent_handled, 100);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 100);
        let mut last_seen: HashMap<&str, i64> = HashMap::new();
        for body in log.iter() {
            let (producer, index) = body.split_once(':').unwrap();
            let index: i64 = index.parse().unwrap();
            let last = last_seen.entry(producer).or_insert(-1);
            assert_eq!(index, *last + 1, "producer {} out of order", producer);
            *last = index;
        }
        assert_eq!(last_seen.len(), 4);
        assert!(last_seen.values().all(|&i| i == 24));
    }

    #[test]
    fn test_idle_dispatcher_drops_promptly() {
        let started = Instant::now();
        let dispatcher = Dispatcher::new(LogHandler).unwrap();
        assert!(dispatcher.is_running());
        drop(dispatcher);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let dispatcher = Dispatcher::new(LogHandler).unwrap();
        let first = dispatcher.shutdown();
        let second = dispatcher.shutdown();
        assert_eq!(second.elapsed, Duration::ZERO);
        assert_eq!(first.stats, second.stats);
        assert!(!dispatcher.is_running());
        assert!(matches!(
            dispatcher.post("a", "b", "late", true),
            Err(Error::Closed)
        ));
        assert_eq!(dispatcher.stats().rejected, 1);
    }

    #[test]
    fn test_discard_drops_pending_work() {
        let (tx, rx) = unbounded();
        let (release_tx, release_rx) = unbounded::<()>();
        let dispatcher = Dispatcher::builder()
            .handler(move |m: &Message| {
                if m.body() == "gate" {
                    let _ = release_rx.recv_timeout(WAIT);
                }
            })
            .event_sink(tx)
            .normal_delay(Duration::from_secs(30))
            .build_quiet();

        dispatcher.post("a", "b", "slow normal", false).unwrap();
        dispatcher.post("a", "b", "gate", true).unwrap();
        dispatcher.post("a", "b", "queued 1", true).unwrap();
        dispatcher.post("a", "b", "queued 2", false).unwrap();
        let gate_popped = DispatchEvent::Popped { seq: 1, path: DispatchPath::Urgent };
        recv_until(&rx, |events| events.contains(&gate_popped));

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            release_tx.send(()).unwrap();
        });
        let report = dispatcher.shutdown();
        stopper.join().unwrap();

        assert_eq!(report.discarded, 2);
        assert_eq!(report.stats.urgent_handled, 1);
        assert_eq!(report.stats.normal_handled, 0);
        assert_eq!(report.stats.dropped, 3);
        assert_eq!(report.stats.in_flight, 0);
        assert!(report.elapsed < Duration::from_secs(10));
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.last(), Some(&DispatchEvent::Stopped));
    }

    #[test]
    fn test_drain_handles_pending_work() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::builder()
            .handler(recording_handler(log.clone()))
            .normal_delay(Duration::from_millis(20))
            .workers(2)
            .shutdown_policy(ShutdownPolicy::Drain)
            .build_quiet();

        for i in 0..10 {
            dispatcher.post("a", "b", i.to_string(), i % 2 == 0).unwrap();
        }
        let report = dispatcher.shutdown();
        assert_eq!(report.discarded, 0);
        assert_eq!(report.stats.urgent_handled, 5);
        assert_eq!(report.stats.normal_handled, 5);
        assert_eq!(report.stats.dropped, 0);
        assert_eq!(log.lock().unwrap().len(), 10);
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let handler_log = log.clone();
        let dispatcher = Dispatcher::builder()
            .handler(move |m: &Message| {
                if m.body().starts_with("bad") {
                    panic!("refusing {}", m.body());
                }
                handler_log.lock().unwrap().push(m.body().to_string());
            })
            .failure_sink(move |f: &HandlerFailure| {
                sink.lock().unwrap().push((f.seq, f.path, f.reason.clone()))
            })
            .normal_delay(Duration::ZERO)
            .shutdown_policy(ShutdownPolicy::Drain)
            .build_quiet();

        dispatcher.post("a", "b", "bad urgent", true).unwrap();
        dispatcher.post("a", "b", "bad normal", false).unwrap();
        dispatcher.post("a", "b", "good", true).unwrap();
        let report = dispatcher.shutdown();

        assert_eq!(report.stats.failed, 2);
        assert_eq!(report.stats.urgent_handled, 1);
        assert_eq!(*log.lock().unwrap(), vec!["good".to_string()]);

        let mut failures = failures.lock().unwrap().clone();
        failures.sort_by_key(|f| f.0);
        assert_eq!(
            failures,
            vec![
                (0, DispatchPath::Urgent, "refusing bad urgent".to_string()),
                (1, DispatchPath::Normal, "refusing bad normal".to_string()),
            ]
        );
    }

    #[test]
    fn test_bounded_queue_rejects_when_full() {
        let (release_tx, release_rx) = unbounded::<()>();
        let (tx, rx) = unbounded();
        let dispatcher = Dispatcher::builder()
            .handler(move |m: &Message| {
                if m.body() == "gate" {
                    let _ = release_rx.recv_timeout(WAIT);
                }
            })
            .event_sink(tx)
            .capacity(2, OverflowPolicy::Reject)
            .shutdown_policy(ShutdownPolicy::Drain)
            .build_quiet();

        dispatcher.post("a", "b", "gate", true).unwrap();
        recv_until(&rx, |events| !events.is_empty());

        dispatcher.post("a", "b", "1", true).unwrap();
        dispatcher.post("a", "b", "2", true).unwrap();
        assert!(matches!(
            dispatcher.post("a", "b", "3", true),
            Err(Error::QueueSaturated { capacity: 2 })
        ));

        release_tx.send(()).unwrap();
        let report = dispatcher.shutdown();
        assert_eq!(report.stats.posted, 3);
        assert_eq!(report.stats.rejected, 1);
        assert_eq!(report.stats.urgent_handled, 3);
    }

    #[test]
    fn test_detached_mode_outlives_shutdown() {
        let (tx, rx) = unbounded();
        let dispatcher = Dispatcher::builder()
            .detached()
            .event_sink(tx)
            .normal_delay(Duration::from_millis(500))
            .build_quiet();

        dispatcher.post("a", "b", "later", false).unwrap();
        recv_until(&rx, |events| !events.is_empty());
        let report = dispatcher.shutdown();
        assert_eq!(report.stats.in_flight, 1);
        assert_eq!(report.stats.normal_handled, 0);

        let events = recv_until(&rx, |events| count_handled(events) == 1);
        assert!(events.contains(&DispatchEvent::Handled { seq: 0, path: DispatchPath::Normal }));
    }

    #[test]
    fn test_full_event_sink_does_not_stall_shutdown() {
        // Kept alive but never read.
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let dispatcher = Dispatcher::builder()
            .event_sink(tx)
            .shutdown_policy(ShutdownPolicy::Drain)
            .build_quiet();

        dispatcher.post("a", "b", "1", true).unwrap();
        dispatcher.post("a", "b", "2", true).unwrap();

        let (done_tx, done_rx) = unbounded();
        thread::spawn(move || {
            let _ = done_tx.send(dispatcher.shutdown());
        });
        let report = done_rx
            .recv_timeout(WAIT)
            .expect("shutdown stalled behind a full event sink");
        assert_eq!(report.stats.popped, 2);
        assert_eq!(report.stats.urgent_handled, 2);
    }

    #[test]
    fn test_stats_never_show_more_popped_than_posted() {
        let dispatcher = Dispatcher::builder()
            .normal_delay(Duration::ZERO)
            .shutdown_policy(ShutdownPolicy::Drain)
            .build_quiet();
        let handle = dispatcher.handle();
        let producer = thread::spawn(move || {
            for i in 0..500 {
                handle.post("a", "b", i.to_string(), i % 2 == 0).unwrap();
            }
        });

        while !producer.is_finished() {
            let stats = dispatcher.stats();
            assert!(stats.popped <= stats.posted, "{:?}", stats);
        }
        producer.join().unwrap();

        let report = dispatcher.shutdown();
        assert_eq!(report.stats.posted, 500);
        assert_eq!(report.stats.popped, 500);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = Dispatcher::builder().workers(0).start();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    impl DispatcherBuilder {
        fn build_quiet(self) -> Dispatcher {
            let _ = env_logger::builder().is_test(true).try_init();
            self.start().unwrap()
        }
    }
}

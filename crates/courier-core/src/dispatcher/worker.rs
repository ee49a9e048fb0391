//! Executors for normal messages.
//!
//! The default executor is a fixed pool of worker threads fed through a
//! crossbeam channel. Each job waits out the configured delay and then runs
//! the handler. The pool is owned by the consumer thread and shut down when
//! the consumer exits.
//!
//! Detached mode spawns one untracked thread per message instead.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use super::context::DispatchContext;
use crate::config::{NormalMode, NormalSettings, ShutdownPolicy};
use crate::error::{Error, Result};
use crate::message::{DispatchPath, Message};

struct Job {
    seq: u64,
    message: Message,
}

pub(crate) enum NormalExecutor {
    Pool(WorkerPool),
    Detached(DetachedSpawner),
}

impl NormalExecutor {
    pub fn start(
        settings: &NormalSettings,
        thread_name: &str,
        ctx: Arc<DispatchContext>,
    ) -> Result<Self> {
        match settings.mode {
            NormalMode::Pool => Ok(Self::Pool(WorkerPool::start(
                settings.workers,
                settings.delay,
                thread_name,
                ctx,
            )?)),
            NormalMode::Detached => Ok(Self::Detached(DetachedSpawner {
                delay: settings.delay,
                thread_name: thread_name.to_string(),
                ctx,
            })),
        }
    }

    /// Hand a message off. Never waits for the handler.
    pub fn submit(&self, seq: u64, message: Message) {
        match self {
            Self::Pool(pool) => pool.submit(seq, message),
            Self::Detached(spawner) => spawner.spawn(seq, message),
        }
    }

    pub fn shutdown(&mut self, policy: ShutdownPolicy) {
        match self {
            Self::Pool(pool) => pool.shutdown(policy),
            Self::Detached(spawner) => {
                let in_flight = spawner.ctx.counters.snapshot(0).in_flight;
                if in_flight > 0 {
                    log::info!(
                        "[WORKER] leaving {} detached worker(s) running past shutdown",
                        in_flight
                    );
                }
            }
        }
    }
}

/// Fixed set of worker threads owned by the dispatcher.
pub(crate) struct WorkerPool {
    job_tx: Option<Sender<Job>>,
    /// Never sent on. Dropping it wakes every worker out of its delay.
    cancel_tx: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
    ctx: Arc<DispatchContext>,
}

impl WorkerPool {
    fn start(
        size: usize,
        delay: Duration,
        thread_name: &str,
        ctx: Arc<DispatchContext>,
    ) -> Result<Self> {
        let (job_tx, job_rx) = unbounded();
        let (cancel_tx, cancel_rx) = bounded(0);

        let mut pool = Self {
            job_tx: Some(job_tx),
            cancel_tx: Some(cancel_tx),
            workers: Vec::with_capacity(size),
            ctx: ctx.clone(),
        };

        for index in 0..size {
            let job_rx = job_rx.clone();
            let cancel_rx = cancel_rx.clone();
            let ctx = ctx.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", thread_name, index))
                .spawn(move || run_worker(job_rx, cancel_rx, ctx, delay));

            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    pool.shutdown(ShutdownPolicy::Discard);
                    return Err(Error::Spawn(e));
                }
            }
        }

        log::debug!("[WORKER] started {} pool worker(s), delay {:?}", size, delay);
        Ok(pool)
    }

    fn submit(&self, seq: u64, message: Message) {
        self.ctx.counters.begin_in_flight();
        let sent = match &self.job_tx {
            Some(tx) => tx.send(Job { seq, message }).is_ok(),
            None => false,
        };
        if !sent {
            log::warn!("[WORKER] pool is shut down, dropping #{}", seq);
            self.ctx.counters.end_in_flight();
            self.ctx.drop_message(seq);
        }
    }

    fn shutdown(&mut self, policy: ShutdownPolicy) {
        if self.job_tx.is_none() && self.workers.is_empty() {
            return;
        }

        match policy {
            ShutdownPolicy::Discard => {
                self.cancel_tx.take();
                self.job_tx.take();
                self.join_workers();
            }
            ShutdownPolicy::Drain => {
                self.job_tx.take();
                self.join_workers();
                self.cancel_tx.take();
            }
        }
        log::debug!("[WORKER] pool stopped ({:?})", policy);
    }

    fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("[WORKER] worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(ShutdownPolicy::Discard);
    }
}

fn run_worker(
    job_rx: Receiver<Job>,
    cancel_rx: Receiver<()>,
    ctx: Arc<DispatchContext>,
    delay: Duration,
) {
    while let Ok(job) = job_rx.recv() {
        // Wait out the delay unless the pool is cancelled first.
        let cancelled = !matches!(cancel_rx.recv_timeout(delay), Err(RecvTimeoutError::Timeout));
        if cancelled {
            log::debug!("[WORKER] discarding #{} on shutdown", job.seq);
            ctx.drop_message(job.seq);
        } else {
            ctx.handle(job.seq, &job.message, DispatchPath::Normal);
        }
        ctx.counters.end_in_flight();
    }
}

/// Spawns one thread per normal message and never joins it.
pub(crate) struct DetachedSpawner {
    delay: Duration,
    thread_name: String,
    ctx: Arc<DispatchContext>,
}

impl DetachedSpawner {
    fn spawn(&self, seq: u64, message: Message) {
        self.ctx.counters.begin_in_flight();
        let ctx = self.ctx.clone();
        let delay = self.delay;

        // The message is moved into the thread; nothing borrows the queue.
        let spawned = thread::Builder::new()
            .name(format!("{}-detached-{}", self.thread_name, seq))
            .spawn(move || {
                thread::sleep(delay);
                ctx.handle(seq, &message, DispatchPath::Normal);
                ctx.counters.end_in_flight();
            });

        if let Err(e) = spawned {
            log::error!("[WORKER] failed to spawn detached worker for #{}: {}", seq, e);
            self.ctx.counters.end_in_flight();
            self.ctx.drop_message(seq);
        }
    }
}

//! State shared by the consumer thread and normal-path workers.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};

use super::stats::Counters;
use crate::events::DispatchEvent;
use crate::handler::{FailureSink, HandlerFailure, MessageHandler};
use crate::message::{DispatchPath, Message};

pub(crate) struct DispatchContext {
    handler: Arc<dyn MessageHandler>,
    failures: Arc<dyn FailureSink>,
    events: Option<Sender<DispatchEvent>>,
    pub counters: Counters,
}

impl DispatchContext {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        failures: Arc<dyn FailureSink>,
        events: Option<Sender<DispatchEvent>>,
    ) -> Self {
        Self {
            handler,
            failures,
            events,
            counters: Counters::default(),
        }
    }

    /// Never blocks. A full sink loses the event; a disconnected one is ignored.
    pub fn emit(&self, event: DispatchEvent) {
        if let Some(tx) = &self.events {
            if let Err(TrySendError::Full(event)) = tx.try_send(event) {
                log::trace!("[DISPATCH] event sink full, dropping {:?}", event);
            }
        }
    }

    /// Run the handler, containing any panic it raises.
    pub fn handle(&self, seq: u64, message: &Message, path: DispatchPath) {
        let handler = &self.handler;
        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(message))) {
            Ok(()) => {
                self.counters.record_handled(path);
                self.emit(DispatchEvent::Handled { seq, path });
            }
            Err(payload) => {
                self.counters.record_failed();
                let failure = HandlerFailure::from_panic(seq, path, message.clone(), payload);
                let failures = &self.failures;
                if panic::catch_unwind(AssertUnwindSafe(|| failures.report(&failure))).is_err() {
                    log::error!("[DISPATCH] failure sink panicked while reporting #{}", seq);
                }
                self.emit(DispatchEvent::Failed { seq, path });
            }
        }
    }

    /// Account for a message discarded without being handled.
    pub fn drop_message(&self, seq: u64) {
        self.counters.record_dropped(1);
        self.emit(DispatchEvent::Dropped { seq });
    }
}

//! Named publish/subscribe channels with deferred delivery.
//!
//! A [`Channel`] decouples event producers from consumers. `emit` runs every
//! listener synchronously in registration order; `delay` queues an event for
//! the next tick flush; `emit_delayed` drains the queue in FIFO order and is
//! called exactly once per server tick by the runtime. A listener fault is
//! logged and dropped without disturbing sibling listeners or the queue.

use log::error;
use std::collections::VecDeque;
use thiserror::Error;

/// Error returned by a listener that could not handle an event.
///
/// The channel logs it and moves on; no fault in a listener is fatal.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

type Listener<E> = Box<dyn FnMut(&E) -> Result<(), ListenerError> + Send>;

pub struct Channel<E> {
    name: &'static str,
    listeners: Vec<Listener<E>>,
    pending: VecDeque<E>,
}

impl<E> Channel<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Registers a listener. Listeners run in registration order.
    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: FnMut(&E) -> Result<(), ListenerError> + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Invokes all listeners for `event` synchronously.
    pub fn emit(&mut self, event: &E) {
        for listener in &mut self.listeners {
            if let Err(err) = listener(event) {
                error!("Listener fault on channel {}: {}", self.name, err);
            }
        }
    }

    /// Queues `event` for the next [`emit_delayed`](Self::emit_delayed) flush.
    pub fn delay(&mut self, event: E) {
        self.pending.push_back(event);
    }

    /// Drains the pending queue, emitting each event in FIFO order.
    ///
    /// Only events queued before the call are flushed; anything a listener
    /// delays during the flush waits for the next tick. A no-op when the
    /// queue is empty.
    pub fn emit_delayed(&mut self) {
        let drained: Vec<E> = self.pending.drain(..).collect();

        for event in &drained {
            self.emit(event);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

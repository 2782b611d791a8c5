use std::collections::VecDeque;

use arrow_array::RecordBatch;
use parking_lot::{Condvar, Mutex};

use crate::Error;

/// The queue of decoded batches shared by the multiplexer and the consumer.
///
/// The multiplexer only produces into the buffer, and the consumer only
/// takes from it. Both sides wait on the same lock, using the conditions
/// below.
#[derive(Debug)]
pub(crate) struct SharedBuffer {
    state: Mutex<State>,
    /// Signalled when batches are added, the live count reaches zero, an
    /// error is latched or the buffer is shut down.
    readable: Condvar,
    /// Signalled when a batch is taken or the buffer is shut down.
    writable: Condvar,
    /// Maximum number of queued batches. `None` if unbounded.
    capacity: Option<usize>,
}

#[derive(Debug, Default)]
struct State {
    batches: VecDeque<RecordBatch>,
    /// Number of calls which have neither closed nor failed.
    live_calls: usize,
    /// The first error reported by any call.
    ///
    /// Once set, it is never cleared.
    error: Option<Error>,
    /// Set when the receiver is shutting down.
    shutdown: bool,
}

/// What happened to the batches of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub(crate) enum Push {
    /// All batches were queued.
    Queued,
    /// The batches were discarded since an error was already latched.
    Discarded,
    /// The buffer was shut down while pushing.
    Shutdown,
}

impl SharedBuffer {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity: capacity.map(|capacity| capacity.max(1)),
        }
    }

    /// Record the number of calls that will feed the buffer.
    pub fn start_calls(&self, count: usize) {
        let mut state = self.state.lock();
        state.live_calls = count;
        if count == 0 {
            std::mem::drop(state);
            self.readable.notify_all();
        }
    }

    /// Queue the batches decoded from one packet.
    ///
    /// Blocks while the buffer is full. Consumers are woken once for the
    /// packet, even if it produced no batches.
    pub fn push_packet(&self, batches: Vec<RecordBatch>) -> Push {
        let mut state = self.state.lock();
        let mut result = Push::Queued;
        'batches: for batch in batches {
            loop {
                if state.shutdown {
                    result = Push::Shutdown;
                    break 'batches;
                } else if state.error.is_some() {
                    result = Push::Discarded;
                    break 'batches;
                } else if self.is_full(&state) {
                    // Let the consumer drain the batches already queued.
                    self.readable.notify_all();
                    self.writable.wait(&mut state);
                } else {
                    break;
                }
            }
            state.batches.push_back(batch);
        }
        std::mem::drop(state);

        self.readable.notify_all();
        result
    }

    /// Record that a call completed normally.
    ///
    /// Returns the number of calls still live.
    pub fn close_call(&self) -> usize {
        let mut state = self.state.lock();
        debug_assert!(state.live_calls > 0, "closing call with no live calls");
        state.live_calls = state.live_calls.saturating_sub(1);
        let remaining = state.live_calls;
        std::mem::drop(state);

        if remaining == 0 {
            self.readable.notify_all();
        }
        remaining
    }

    /// Record that a call failed.
    ///
    /// Returns `true` if this was the first error, in which case it is
    /// latched and reported to the consumer. Later errors are dropped.
    pub fn fail_call(&self, error: Error) -> bool {
        let mut state = self.state.lock();
        debug_assert!(state.live_calls > 0, "failing call with no live calls");
        state.live_calls = state.live_calls.saturating_sub(1);
        let latched = Self::latch(&mut state, error);
        std::mem::drop(state);

        self.readable.notify_all();
        self.writable.notify_all();
        latched
    }

    /// Latch an error that isn't associated with a live call.
    pub fn latch_error(&self, error: Error) -> bool {
        let latched = Self::latch(&mut self.state.lock(), error);
        self.readable.notify_all();
        self.writable.notify_all();
        latched
    }

    fn latch(state: &mut State, error: Error) -> bool {
        if state.error.is_some() {
            false
        } else {
            // Queued batches can no longer be observed.
            state.batches.clear();
            state.error = Some(error);
            true
        }
    }

    /// Take the next batch, blocking until one is available.
    ///
    /// Returns the latched error if any call failed, and `None` once all
    /// calls have completed and the queue is empty.
    pub fn next_batch(&self) -> Result<Option<RecordBatch>, Error> {
        let mut state = self.state.lock();
        loop {
            if let Some(error) = &state.error {
                return Err(error.clone());
            } else if let Some(batch) = state.batches.pop_front() {
                std::mem::drop(state);
                self.writable.notify_one();
                return Ok(Some(batch));
            } else if state.live_calls == 0 || state.shutdown {
                return Ok(None);
            }
            self.readable.wait(&mut state);
        }
    }

    /// Release all waiters. Later pushes are rejected.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    pub fn is_error_latched(&self) -> bool {
        self.state.lock().error.is_some()
    }

    #[cfg(test)]
    pub fn live_calls(&self) -> usize {
        self.state.lock().live_calls
    }

    fn is_full(&self, state: &State) -> bool {
        self.capacity
            .map_or(false, |capacity| state.batches.len() >= capacity)
    }
}

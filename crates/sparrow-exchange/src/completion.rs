//! The completion channel shared by all calls of a receiver.
//!
//! Asynchronous operations started by a call report their completion by
//! posting the call's [CallTag] to the queue. The multiplexer blocks on
//! [CompletionQueue::next] and dispatches each completion to the call
//! owning the tag.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Identifies the call an asynchronous operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display(fmt = "call {_0}")]
pub struct CallTag(usize);

impl CallTag {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl From<usize> for CallTag {
    fn from(index: usize) -> Self {
        CallTag(index)
    }
}

/// The completion of an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub tag: CallTag,
    /// Whether the operation succeeded.
    ///
    /// What a failure means depends on the operation. For reads, it indicates
    /// the stream has no more packets.
    pub ok: bool,
}

#[derive(Debug, Default)]
struct State {
    completions: VecDeque<Completion>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    condition: Condvar,
}

/// A multi-producer, single-consumer queue of completions.
#[derive(Debug, Default)]
pub struct CompletionQueue {
    inner: Arc<Inner>,
}

/// The producing side of a [CompletionQueue].
///
/// Handed to the transport so it may report completions from any thread. It
/// keeps the queue's state alive, so operations which complete after the
/// receiver is gone are silently discarded.
#[derive(Debug, Clone)]
pub struct CompletionNotifier {
    inner: Arc<Inner>,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifier(&self) -> CompletionNotifier {
        CompletionNotifier {
            inner: self.inner.clone(),
        }
    }

    /// Block until the next completion is available.
    ///
    /// Returns `None` once the queue has been shut down, even if completions
    /// are still queued.
    pub fn next(&self) -> Option<Completion> {
        let mut state = self.inner.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(completion) = state.completions.pop_front() {
                return Some(completion);
            }
            self.inner.condition.wait(&mut state);
        }
    }

    /// Return the next completion if one is queued.
    pub fn try_next(&self) -> Option<Completion> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            None
        } else {
            state.completions.pop_front()
        }
    }

    /// Shut down the queue, waking any thread blocked in [Self::next].
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if !state.shutdown {
            state.shutdown = true;
            let dropped = state.completions.len();
            state.completions.clear();
            std::mem::drop(state);

            tracing::trace!("Shut down completion queue. Dropped {dropped} completions.");
            self.inner.condition.notify_all();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }
}

impl CompletionNotifier {
    /// Post the completion of an operation for the call with the given tag.
    ///
    /// Returns `false` if the queue has been shut down.
    pub fn notify(&self, tag: CallTag, ok: bool) -> bool {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return false;
        }
        state.completions.push_back(Completion { tag, ok });
        std::mem::drop(state);

        self.inner.condition.notify_one();
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_completions_are_fifo() {
        let queue = CompletionQueue::new();
        let notifier = queue.notifier();
        assert!(notifier.notify(1.into(), true));
        assert!(notifier.notify(0.into(), false));

        assert_eq!(
            queue.next(),
            Some(Completion {
                tag: 1.into(),
                ok: true
            })
        );
        assert_eq!(
            queue.next(),
            Some(Completion {
                tag: 0.into(),
                ok: false
            })
        );
    }

    #[test]
    fn test_shutdown_wakes_blocked_consumer() {
        let queue = Arc::new(CompletionQueue::new());

        let handle = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.next())
        };

        std::thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn test_notify_from_other_thread() {
        let queue = CompletionQueue::new();
        let notifier = queue.notifier();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            notifier.notify(3.into(), true);
        });

        assert_eq!(queue.next().map(|c| c.tag), Some(3.into()));
    }

    #[test]
    fn test_shutdown_drops_pending_and_later_completions() {
        let queue = CompletionQueue::new();
        let notifier = queue.notifier();
        assert!(notifier.notify(0.into(), true));

        queue.shutdown();
        assert!(queue.is_shutdown());
        assert!(!notifier.notify(1.into(), true));
        assert_eq!(queue.next(), None);
        assert_eq!(queue.try_next(), None);
    }

    #[test]
    fn test_try_next_does_not_block() {
        let queue = CompletionQueue::new();
        assert_eq!(queue.try_next(), None);
        queue.notifier().notify(2.into(), false);
        assert_eq!(queue.try_next().map(|c| (c.tag, c.ok)), Some((2.into(), false)));
        assert_eq!(queue.try_next(), None);
    }
}

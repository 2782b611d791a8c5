use std::sync::Arc;

use error_stack::Report;

use crate::buffer::SharedBuffer;
use crate::call::{RemoteCall, Transition};
use crate::{CallTag, Completion, CompletionQueue, Error};

/// Dispatches completions to the calls owning them.
///
/// The multiplexer is the only mutator of the calls while it runs. All
/// effects visible to the consumer go through the [SharedBuffer].
pub(crate) struct Multiplexer {
    /// The calls, indexed by [CallTag].
    calls: Vec<RemoteCall>,
    completions: Arc<CompletionQueue>,
    buffer: Arc<SharedBuffer>,
    cancel_on_error: bool,
}

impl Multiplexer {
    pub fn new(
        calls: Vec<RemoteCall>,
        completions: Arc<CompletionQueue>,
        buffer: Arc<SharedBuffer>,
        cancel_on_error: bool,
    ) -> Self {
        debug_assert!(
            calls
                .iter()
                .enumerate()
                .all(|(index, call)| call.tag().index() == index),
            "calls must be indexed by tag"
        );
        Self {
            calls,
            completions,
            buffer,
            cancel_on_error,
        }
    }

    /// Run until the completion queue is shut down.
    ///
    /// Returns the calls, so the owner decides when they are released. If
    /// dispatching panics, [Error::MultiplexerPanic] is latched before the
    /// thread unwinds, so the consumer doesn't wait for calls that will
    /// never complete.
    pub fn run(mut self) -> Vec<RemoteCall> {
        let buffer = self.buffer.clone();
        let _guard = LatchOnPanic(&buffer);

        tracing::info!("Starting multiplexer for {} calls", self.calls.len());
        let mut dispatched = 0;
        while let Some(completion) = self.completions.next() {
            self.dispatch(completion);
            dispatched += 1;
        }
        tracing::info!("Completion queue shut down. Stopping multiplexer after {dispatched} completions.");
        self.calls
    }

    pub fn dispatch(&mut self, completion: Completion) {
        let Completion { tag, ok } = completion;
        let Some(call) = self.calls.get_mut(tag.index()) else {
            tracing::warn!("Ignoring completion for unknown {tag}");
            return;
        };

        match call.on_completion(ok, &self.buffer) {
            Transition::Pending | Transition::Ignored => {}
            Transition::Closed => {
                let remaining = self.buffer.close_call();
                tracing::info!("Stream from {} closed. {remaining} remaining.", call.sender());
            }
            Transition::Failed(report) => self.fail(tag, report),
            Transition::Abandoned => {
                tracing::debug!("Abandoned {tag} during shutdown");
            }
        }
    }

    fn fail(&mut self, tag: CallTag, report: Report<Error>) {
        if !self.buffer.fail_call(report.current_context().clone()) {
            tracing::debug!("Dropping error after the first failure: {report:?}");
            return;
        }

        tracing::warn!("Exchange failed: {report:?}");
        if self.cancel_on_error {
            for call in self.calls.iter_mut().filter(|call| call.tag() != tag) {
                call.cancel();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn call(&self, tag: CallTag) -> &RemoteCall {
        &self.calls[tag.index()]
    }
}

/// Latches [Error::MultiplexerPanic] if dropped while panicking.
struct LatchOnPanic<'a>(&'a SharedBuffer);

impl Drop for LatchOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!("Exchange multiplexer panicked");
            self.0.latch_error(Error::MultiplexerPanic);
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use tonic::Code;

use crate::buffer::{Push, SharedBuffer};
use crate::client::{ExchangeClient, PacketStream};
use crate::codec::{DecodeError, PacketDecoder};
use crate::{CallTag, CompletionNotifier, EstablishRequest, Error, TaskMeta};

/// The protocol state of a [RemoteCall].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum CallState {
    /// The call has not been issued.
    Unstarted,
    /// The establish request is outstanding.
    RequestSent,
    /// A read is outstanding.
    AwaitingData,
    /// A packet is being decoded into the buffer.
    Decoding,
    /// The stream has no more packets and the final status is outstanding.
    Closing,
    /// The stream completed successfully.
    Closed,
    /// The call failed or was cancelled.
    Errored,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Closed | CallState::Errored)
    }
}

/// The effect of a completion on a call.
#[derive(Debug)]
#[must_use]
pub(crate) enum Transition {
    /// The call started its next operation.
    Pending,
    /// The stream completed successfully.
    Closed,
    /// The call failed.
    Failed(Report<Error>),
    /// The buffer was shut down while the call was delivering batches.
    Abandoned,
    /// The call had already terminated, so the completion was ignored.
    Ignored,
}

/// A streaming call pulling packets from one sender.
///
/// Each call has at most one operation outstanding. The completion of that
/// operation is dispatched to [RemoteCall::on_completion] by the multiplexer,
/// which decides the next operation.
pub(crate) struct RemoteCall {
    tag: CallTag,
    sender: TaskMeta,
    state: CallState,
    stream: Option<Box<dyn PacketStream>>,
    decoder: Arc<PacketDecoder>,
    /// Set once cancellation was requested.
    cancelled: bool,
    /// Number of packets received. Used for logging.
    packets: usize,
}

impl std::fmt::Debug for RemoteCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCall")
            .field("tag", &self.tag)
            .field("sender", &self.sender)
            .field("state", &self.state)
            .field("cancelled", &self.cancelled)
            .field("packets", &self.packets)
            .finish_non_exhaustive()
    }
}

impl RemoteCall {
    pub fn new(tag: CallTag, sender: TaskMeta, decoder: Arc<PacketDecoder>) -> Self {
        Self {
            tag,
            sender,
            state: CallState::Unstarted,
            stream: None,
            decoder,
            cancelled: false,
            packets: 0,
        }
    }

    pub fn tag(&self) -> CallTag {
        self.tag
    }

    pub fn sender(&self) -> &TaskMeta {
        &self.sender
    }

    #[cfg(test)]
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Issue the establish request for this call.
    ///
    /// On error the call is `Errored` and no completion will arrive for it.
    pub fn start(
        &mut self,
        client: &dyn ExchangeClient,
        receiver: &TaskMeta,
        timeout: Duration,
        notifier: CompletionNotifier,
    ) -> error_stack::Result<(), Error> {
        debug_assert_eq!(self.state, CallState::Unstarted, "call started twice");

        let request = EstablishRequest {
            sender: self.sender.clone(),
            receiver: receiver.clone(),
            timeout,
        };
        match client.establish(request, self.tag, notifier) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.transition(CallState::RequestSent);
                Ok(())
            }
            Err(report) => {
                self.transition(CallState::Errored);
                Err(report).change_context(Error::Establish {
                    sender: self.sender.clone(),
                })
            }
        }
    }

    /// Handle the completion of the outstanding operation.
    pub fn on_completion(&mut self, ok: bool, buffer: &SharedBuffer) -> Transition {
        if self.cancelled && !self.state.is_terminal() {
            let error = Error::Cancelled {
                sender: self.sender.clone(),
            };
            return self.fail(Report::new(error));
        }

        let Some(stream) = self.stream.as_mut() else {
            return if self.state.is_terminal() {
                Transition::Ignored
            } else {
                self.fail(Report::new(self.protocol_error()))
            };
        };

        match (self.state, ok) {
            (CallState::RequestSent, true) => {
                tracing::debug!("Established stream from {}", self.sender);
                stream.read();
                self.transition(CallState::AwaitingData);
                Transition::Pending
            }
            (CallState::RequestSent, false) => {
                let status = stream.status();
                let error = if status.code() == Code::Ok {
                    Error::Establish {
                        sender: self.sender.clone(),
                    }
                } else {
                    self.status_error(&status)
                };
                self.fail(Report::new(error))
            }
            (CallState::AwaitingData, true) => self.on_packet(buffer),
            (CallState::AwaitingData, false) => {
                stream.finish();
                self.transition(CallState::Closing);
                Transition::Pending
            }
            (CallState::Closing, true) => {
                let status = stream.status();
                if status.code() == Code::Ok {
                    tracing::debug!(
                        "Stream from {} completed after {} packets",
                        self.sender,
                        self.packets
                    );
                    self.transition(CallState::Closed);
                    Transition::Closed
                } else {
                    let error = self.status_error(&status);
                    self.fail(Report::new(error))
                }
            }
            (CallState::Closing, false) => {
                let error = Error::Transport {
                    sender: self.sender.clone(),
                    code: Code::Unknown,
                    message: "failed to retrieve final status".to_owned(),
                };
                self.fail(Report::new(error))
            }
            (CallState::Closed | CallState::Errored, _) => {
                tracing::trace!(
                    "Ignoring completion (ok = {ok}) for {} in state {}",
                    self.tag,
                    self.state
                );
                Transition::Ignored
            }
            (CallState::Unstarted | CallState::Decoding, _) => {
                let error = self.protocol_error();
                self.fail(Report::new(error))
            }
        }
    }

    /// Cancel the call.
    ///
    /// The outstanding operation is cancelled, if any. The next completion
    /// for the call (whatever its outcome) drives it to `Errored`.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() || self.cancelled {
            return;
        }
        self.cancelled = true;
        if let Some(stream) = self.stream.as_mut() {
            tracing::debug!("Cancelling call to {} in state {}", self.sender, self.state);
            stream.cancel();
        }
    }

    fn on_packet(&mut self, buffer: &SharedBuffer) -> Transition {
        self.transition(CallState::Decoding);
        let Some(stream) = self.stream.as_mut() else {
            return self.fail(Report::new(self.protocol_error()));
        };
        let Some(packet) = stream.take_packet() else {
            return self.fail(Report::new(self.protocol_error()));
        };
        self.packets += 1;

        if let Some(error) = &packet.error {
            let error = Error::Remote {
                sender: self.sender.clone(),
                code: error.code,
                message: error.msg.clone(),
            };
            return self.fail(Report::new(error));
        }

        let batches = match self.decoder.decode(&packet) {
            Ok(batches) => batches,
            Err(report) => {
                let error = match report.current_context() {
                    DecodeError::Unsupported(encode_type) => Error::UnsupportedEncoding {
                        sender: self.sender.clone(),
                        encode_type: *encode_type,
                    },
                    _ => Error::Decode {
                        sender: self.sender.clone(),
                    },
                };
                return self.fail(report.change_context(error));
            }
        };

        match buffer.push_packet(batches) {
            Push::Queued | Push::Discarded => {
                stream.read();
                self.transition(CallState::AwaitingData);
                Transition::Pending
            }
            Push::Shutdown => {
                stream.cancel();
                self.transition(CallState::Errored);
                Transition::Abandoned
            }
        }
    }

    fn fail(&mut self, report: Report<Error>) -> Transition {
        // Nothing is outstanding, so this only releases the stream.
        if let Some(stream) = self.stream.as_mut() {
            stream.cancel();
        }
        self.transition(CallState::Errored);
        Transition::Failed(report)
    }

    fn status_error(&self, status: &tonic::Status) -> Error {
        if status.code() == Code::Cancelled {
            Error::Cancelled {
                sender: self.sender.clone(),
            }
        } else {
            Error::Transport {
                sender: self.sender.clone(),
                code: status.code(),
                message: status.message().to_owned(),
            }
        }
    }

    fn protocol_error(&self) -> Error {
        Error::Protocol {
            sender: self.sender.clone(),
            state: self.state,
        }
    }

    fn transition(&mut self, state: CallState) {
        tracing::trace!("{} ({}): {} -> {state}", self.tag, self.sender, self.state);
        self.state = state;
    }
}

//! The transport used to pull packets from the remote senders.
//!
//! The interface follows the asynchronous gRPC client model: each operation
//! on a [PacketStream] is started without blocking, and its completion is
//! reported by posting the call's tag to the shared [CompletionNotifier].
//! At most one operation is outstanding per stream.

mod tokio_client;

pub use tokio_client::*;

use crate::{CallTag, CompletionNotifier, DataPacket, EstablishRequest, TaskMeta};

#[derive(derive_more::Display, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[display(fmt = "unable to start call to {_0}")]
    Start(TaskMeta),
}

impl error_stack::Context for TransportError {}

/// Opens streams of packets from sender tasks.
pub trait ExchangeClient: Send + Sync {
    /// Start the streaming call described by `request`.
    ///
    /// Once the call has been started (or failed to start) a completion is
    /// posted for `tag`. Errors returned directly indicate the call could
    /// not be issued at all, and no completion will be posted.
    fn establish(
        &self,
        request: EstablishRequest,
        tag: CallTag,
        notifier: CompletionNotifier,
    ) -> error_stack::Result<Box<dyn PacketStream>, TransportError>;
}

/// One streaming call to a sender.
pub trait PacketStream: Send {
    /// Start reading the next packet.
    ///
    /// Completes with `ok = true` when a packet is available from
    /// [Self::take_packet], and with `ok = false` when the stream has no more
    /// packets (either because it ended or because it failed).
    fn read(&mut self);

    /// Take the packet delivered by the last successful read.
    fn take_packet(&mut self) -> Option<DataPacket>;

    /// Start retrieving the final status of the call.
    ///
    /// Completes with `ok = true` once [Self::status] is available.
    fn finish(&mut self);

    /// The final status of the call.
    ///
    /// Only meaningful after `finish` has completed, or after establishing
    /// the call completed with `ok = false`.
    fn status(&mut self) -> tonic::Status;

    /// Cancel the call.
    ///
    /// If an operation is outstanding, it completes with `ok = false`.
    fn cancel(&mut self);
}

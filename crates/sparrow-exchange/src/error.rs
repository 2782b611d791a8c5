use crate::TaskMeta;

/// Errors reported by the exchange receiver.
///
/// The receiver latches the first of these and reports it on every
/// following pull, so the context is `Clone`. The full report that
/// produced it is logged where the failure was observed.
#[derive(derive_more::Display, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[display(fmt = "failed to establish connection to sender {sender}")]
    Establish { sender: TaskMeta },
    #[display(fmt = "transport error from sender {sender}: {code:?}: {message}")]
    Transport {
        sender: TaskMeta,
        code: tonic::Code,
        message: String,
    },
    #[display(fmt = "sender {sender} reported error {code}: {message}")]
    Remote {
        sender: TaskMeta,
        code: i32,
        message: String,
    },
    #[display(fmt = "unsupported encode type {encode_type} in packet from sender {sender}")]
    UnsupportedEncoding { sender: TaskMeta, encode_type: i32 },
    #[display(fmt = "failed to decode packet from sender {sender}")]
    Decode { sender: TaskMeta },
    #[display(fmt = "unexpected completion for sender {sender} in state {state}")]
    Protocol {
        sender: TaskMeta,
        state: crate::CallState,
    },
    #[display(fmt = "call to sender {sender} was cancelled")]
    Cancelled { sender: TaskMeta },
    #[display(fmt = "spawning exchange multiplexer")]
    SpawnMultiplexer,
    #[display(fmt = "exchange multiplexer panicked")]
    MultiplexerPanic,
}

impl error_stack::Context for Error {}

impl Error {
    /// Return the sender task associated with this error, if any.
    pub fn sender(&self) -> Option<&TaskMeta> {
        match self {
            Error::Establish { sender }
            | Error::Transport { sender, .. }
            | Error::Remote { sender, .. }
            | Error::UnsupportedEncoding { sender, .. }
            | Error::Decode { sender }
            | Error::Protocol { sender, .. }
            | Error::Cancelled { sender } => Some(sender),
            Error::SpawnMultiplexer | Error::MultiplexerPanic => None,
        }
    }
}

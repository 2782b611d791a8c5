#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! Receiving side of the MPP exchange.
//!
//! An [ExchangeReceiver] pulls the partial results of a query from many
//! remote sender tasks and presents them to the local operator as a single
//! stream of record batches. Each sender is read by one streaming call, and
//! all calls are driven by a single multiplexer thread.

mod buffer;
mod call;
mod client;
mod codec;
mod completion;
mod descriptor;
mod error;
mod multiplexer;
mod options;
mod receiver;
mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


pub use call::CallState;
pub use client::*;
pub use codec::{ArrowIpcCodec, ChunkCodec, DecodeError, JsonRowsCodec, PacketDecoder};
pub use completion::*;
pub use descriptor::*;
pub use error::*;
pub use options::*;
pub use receiver::*;
pub use wire::*;

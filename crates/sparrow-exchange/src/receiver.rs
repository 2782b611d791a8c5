use std::sync::Arc;
use std::thread::JoinHandle;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use error_stack::{IntoReport, Report, ResultExt};
use itertools::Itertools;
use parking_lot::Mutex;

use crate::buffer::SharedBuffer;
use crate::call::RemoteCall;
use crate::client::ExchangeClient;
use crate::codec::PacketDecoder;
use crate::multiplexer::Multiplexer;
use crate::{CompletionQueue, Error, ExchangeOptions, ReceiverDescriptor, TaskMeta};

enum Lifecycle {
    Created,
    /// The multiplexer is running. Joining it returns the calls.
    Running(JoinHandle<Vec<RemoteCall>>),
    /// The multiplexer could not be started.
    Failed,
    Stopped,
}

/// Pulls batches from the senders of an exchange.
///
/// Each sender is read by one streaming call. All calls share a completion
/// queue, which is drained by a dedicated multiplexer thread decoding the
/// packets into a shared buffer. The consumer takes batches from the buffer
/// with [ExchangeReceiver::next_batch].
///
/// Batches from the same sender are returned in the order they were sent.
/// There is no ordering between senders.
pub struct ExchangeReceiver {
    descriptor: ReceiverDescriptor,
    schema: SchemaRef,
    decoder: Arc<PacketDecoder>,
    client: Arc<dyn ExchangeClient>,
    options: ExchangeOptions,
    completions: Arc<CompletionQueue>,
    buffer: Arc<SharedBuffer>,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for ExchangeReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeReceiver")
            .field("descriptor", &self.descriptor)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ExchangeReceiver {
    /// Create a receiver decoding all built-in encodings.
    pub fn new(
        descriptor: ReceiverDescriptor,
        client: Arc<dyn ExchangeClient>,
        options: ExchangeOptions,
    ) -> Self {
        let decoder = PacketDecoder::new(descriptor.output_schema());
        Self::with_decoder(descriptor, client, decoder, options)
    }

    /// Create a receiver using a specific decoder.
    ///
    /// The decoder should produce the output schema of the `descriptor`.
    pub fn with_decoder(
        descriptor: ReceiverDescriptor,
        client: Arc<dyn ExchangeClient>,
        decoder: PacketDecoder,
        options: ExchangeOptions,
    ) -> Self {
        debug_assert_eq!(
            decoder.schema(),
            &descriptor.output_schema(),
            "decoder schema should match descriptor"
        );
        Self {
            schema: decoder.schema().clone(),
            descriptor,
            decoder: Arc::new(decoder),
            client,
            buffer: Arc::new(SharedBuffer::new(options.max_buffered_batches)),
            options,
            completions: Arc::new(CompletionQueue::new()),
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    /// The schema of the batches returned by the receiver.
    pub fn output_schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn sender_tasks(&self) -> &[TaskMeta] {
        &self.descriptor.senders
    }

    /// Start the calls to all senders and the multiplexer.
    ///
    /// Only the first invocation has an effect. Failures of individual calls
    /// are reported by [Self::next_batch].
    pub fn initialize(&self) -> error_stack::Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Created) {
            return Ok(());
        }

        let receiver = &self.descriptor.receiver;
        let senders = &self.descriptor.senders;
        tracing::info!("Starting exchange receiver {receiver} for {} senders", senders.len());

        self.buffer.start_calls(senders.len());
        let mut calls = senders
            .iter()
            .enumerate()
            .map(|(index, sender)| RemoteCall::new(index.into(), sender.clone(), self.decoder.clone()))
            .collect_vec();

        for call in calls.iter_mut() {
            let started = call.start(
                self.client.as_ref(),
                receiver,
                self.options.timeout,
                self.completions.notifier(),
            );
            if let Err(report) = started {
                if self.buffer.fail_call(report.current_context().clone()) {
                    tracing::warn!("Exchange failed: {report:?}");
                }
            }
        }

        if self.options.cancel_on_error && self.buffer.is_error_latched() {
            calls.iter_mut().for_each(RemoteCall::cancel);
        }

        let multiplexer = Multiplexer::new(
            calls,
            self.completions.clone(),
            self.buffer.clone(),
            self.options.cancel_on_error,
        );
        let span = tracing::info_span!("exchange", receiver = %receiver);
        let spawned = std::thread::Builder::new()
            .name(format!("exchange-{}", receiver.task_id))
            .spawn(move || {
                let _enter = span.enter();
                multiplexer.run()
            })
            .into_report()
            .change_context(Error::SpawnMultiplexer);

        match spawned {
            Ok(handle) => {
                *lifecycle = Lifecycle::Running(handle);
                Ok(())
            }
            Err(report) => {
                self.buffer.latch_error(Error::SpawnMultiplexer);
                *lifecycle = Lifecycle::Failed;
                Err(report)
            }
        }
    }

    /// Return the next batch, blocking until one is available.
    ///
    /// Returns `Ok(None)` once every sender completed and all batches were
    /// returned. If any call failed, returns the first error, now and on
    /// every later call.
    pub fn next_batch(&self) -> error_stack::Result<Option<RecordBatch>, Error> {
        self.initialize()?;
        self.buffer.next_batch().map_err(Report::new)
    }

    /// Iterate over the remaining batches.
    ///
    /// The iterator ends after the last batch or after the first error.
    pub fn batches(&self) -> Batches<'_> {
        Batches {
            receiver: self,
            done: false,
        }
    }

    /// Stop the receiver, releasing the calls.
    ///
    /// Unlike dropping the receiver, this reports whether the multiplexer
    /// panicked.
    pub fn close(mut self) -> error_stack::Result<(), Error> {
        self.stop()
    }

    fn stop(&mut self) -> error_stack::Result<(), Error> {
        // Release the multiplexer if it is waiting for space in the buffer,
        // and then stop it.
        self.buffer.shutdown();
        self.completions.shutdown();

        let lifecycle = std::mem::replace(self.lifecycle.get_mut(), Lifecycle::Stopped);
        if let Lifecycle::Running(handle) = lifecycle {
            match handle.join() {
                Ok(calls) => {
                    tracing::debug!("Releasing {} calls", calls.len());
                    std::mem::drop(calls);
                }
                Err(_) => error_stack::bail!(Error::MultiplexerPanic),
            }
        }
        Ok(())
    }
}

impl Drop for ExchangeReceiver {
    fn drop(&mut self) {
        if let Err(report) = self.stop() {
            tracing::error!("Failed to stop exchange receiver: {report:?}");
        }
    }
}

/// Iterator over the batches of an [ExchangeReceiver].
pub struct Batches<'a> {
    receiver: &'a ExchangeReceiver,
    done: bool,
}

impl<'a> Iterator for Batches<'a> {
    type Item = error_stack::Result<RecordBatch, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.receiver.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(report) => {
                self.done = true;
                Some(Err(report))
            }
        }
    }
}

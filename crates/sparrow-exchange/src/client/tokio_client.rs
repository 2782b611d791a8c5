use std::future::Future;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tonic::{Code, Status};

use crate::client::{ExchangeClient, PacketStream, TransportError};
use crate::{CallTag, CompletionNotifier, DataPacket, EstablishRequest};

/// The asynchronous stream of packets from one sender.
///
/// A `tonic::Streaming<DataPacket>` may be used after boxing.
pub type AsyncPacketStream = BoxStream<'static, Result<DataPacket, Status>>;

/// Opens the asynchronous stream for an establish request.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, request: EstablishRequest) -> Result<AsyncPacketStream, Status>;
}

#[async_trait::async_trait]
impl<F, Fut> Connector for F
where
    F: Fn(EstablishRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AsyncPacketStream, Status>> + Send + 'static,
{
    async fn connect(&self, request: EstablishRequest) -> Result<AsyncPacketStream, Status> {
        (self)(request).await
    }
}

/// An [ExchangeClient] driving asynchronous streams on a tokio runtime.
///
/// Each operation runs as a task on the runtime and posts its completion
/// when done. The deadline of the request (`timeout` after establishing)
/// applies to connecting and to every read.
pub struct TokioExchangeClient<C> {
    runtime: Handle,
    connector: Arc<C>,
}

impl<C: Connector> TokioExchangeClient<C> {
    pub fn new(runtime: Handle, connector: C) -> Self {
        Self {
            runtime,
            connector: Arc::new(connector),
        }
    }
}

impl<C: Connector> ExchangeClient for TokioExchangeClient<C> {
    fn establish(
        &self,
        request: EstablishRequest,
        tag: CallTag,
        notifier: CompletionNotifier,
    ) -> error_stack::Result<Box<dyn PacketStream>, TransportError> {
        let deadline = Instant::now() + request.timeout;
        let mut stream = TokioPacketStream {
            runtime: self.runtime.clone(),
            tag,
            notifier,
            deadline,
            shared: Arc::default(),
            task: None,
        };

        let connector = self.connector.clone();
        stream.spawn(async move {
            let sender = request.sender.clone();
            match tokio::time::timeout_at(deadline, connector.connect(request)).await {
                Ok(Ok(stream)) => Outcome::Connected(stream),
                Ok(Err(status)) => Outcome::Failed(status),
                Err(_) => Outcome::Failed(Status::deadline_exceeded(format!(
                    "timed out connecting to {sender}"
                ))),
            }
        });
        Ok(Box::new(stream))
    }
}

enum Outcome {
    Connected(AsyncPacketStream),
    Packet(AsyncPacketStream, DataPacket),
    End,
    Failed(Status),
}

#[derive(Default)]
struct Shared {
    stream: Option<AsyncPacketStream>,
    packet: Option<DataPacket>,
    /// The final status, if the call failed.
    status: Option<Status>,
    /// Whether an operation is outstanding.
    ///
    /// Cleared by whoever reports the completion, so that a task racing
    /// with cancellation doesn't report a second completion.
    outstanding: bool,
}

impl Shared {
    /// Record the outcome of an operation, returning the `ok` to report.
    fn apply(&mut self, outcome: Outcome) -> bool {
        match outcome {
            Outcome::Connected(stream) => {
                self.stream = Some(stream);
                true
            }
            Outcome::Packet(stream, packet) => {
                self.stream = Some(stream);
                self.packet = Some(packet);
                true
            }
            Outcome::End => false,
            Outcome::Failed(status) => {
                self.status = Some(status);
                false
            }
        }
    }
}

struct TokioPacketStream {
    runtime: Handle,
    tag: CallTag,
    notifier: CompletionNotifier,
    deadline: Instant,
    shared: Arc<Mutex<Shared>>,
    task: Option<JoinHandle<()>>,
}

impl TokioPacketStream {
    fn spawn(&mut self, operation: impl Future<Output = Outcome> + Send + 'static) {
        self.shared.lock().outstanding = true;

        let completer = Completer {
            shared: self.shared.clone(),
            notifier: self.notifier.clone(),
            tag: self.tag,
        };
        self.task = Some(self.runtime.spawn(async move {
            let outcome = operation.await;
            completer.complete(Some(outcome));
        }));
    }
}

/// Reports the completion of the operation it was moved into.
///
/// If the operation is dropped before finishing, because it panicked or the
/// runtime shut down, the completion is reported as failed when the
/// completer is dropped along with it.
struct Completer {
    shared: Arc<Mutex<Shared>>,
    notifier: CompletionNotifier,
    tag: CallTag,
}

impl Completer {
    fn complete(&self, outcome: Option<Outcome>) {
        let ok = {
            let mut shared = self.shared.lock();
            if !shared.outstanding {
                if outcome.is_some() {
                    tracing::trace!("Discarding outcome of cancelled operation for {}", self.tag);
                }
                return;
            }
            shared.outstanding = false;
            match outcome {
                Some(outcome) => shared.apply(outcome),
                None => {
                    tracing::warn!("Operation for {} dropped before completing", self.tag);
                    shared.stream = None;
                    shared.status = Some(Status::internal("operation dropped before completing"));
                    false
                }
            }
        };
        self.notifier.notify(self.tag, ok);
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        self.complete(None);
    }
}

impl PacketStream for TokioPacketStream {
    fn read(&mut self) {
        let Some(mut stream) = self.shared.lock().stream.take() else {
            // The stream already ended, failed or was cancelled.
            self.notifier.notify(self.tag, false);
            return;
        };

        let deadline = self.deadline;
        self.spawn(async move {
            let next = tokio::time::timeout_at(deadline, stream.next()).await;
            match next {
                Ok(Some(Ok(packet))) => Outcome::Packet(stream, packet),
                Ok(Some(Err(status))) => Outcome::Failed(status),
                Ok(None) => Outcome::End,
                Err(_) => Outcome::Failed(Status::deadline_exceeded("timed out reading packet")),
            }
        });
    }

    fn take_packet(&mut self) -> Option<DataPacket> {
        self.shared.lock().packet.take()
    }

    fn finish(&mut self) {
        // The status is known once the last read completed.
        self.notifier.notify(self.tag, true);
    }

    fn status(&mut self) -> Status {
        self.shared
            .lock()
            .status
            .take()
            .unwrap_or_else(|| Status::new(Code::Ok, ""))
    }

    fn cancel(&mut self) {
        let mut shared = self.shared.lock();
        shared.stream = None;
        if shared.outstanding {
            shared.outstanding = false;
            shared.status = Some(Status::cancelled("cancelled by receiver"));
            std::mem::drop(shared);

            if let Some(task) = self.task.take() {
                task.abort();
            }
            self.notifier.notify(self.tag, false);
        }
    }
}

impl Drop for TokioPacketStream {
    fn drop(&mut self) {
        self.shared.lock().outstanding = false;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{CompletionQueue, EncodeType, TaskMeta};

    fn request(timeout: Duration) -> EstablishRequest {
        EstablishRequest {
            sender: TaskMeta::new(1, 1, "sender"),
            receiver: TaskMeta::new(1, 0, "receiver"),
            timeout,
        }
    }

    fn packet(value: u8) -> DataPacket {
        DataPacket::new(EncodeType::JsonRows, vec![vec![value]])
    }

    #[test]
    fn test_stream_protocol() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let client = TokioExchangeClient::new(runtime.handle().clone(), |_: EstablishRequest| async {
            let packets = vec![Ok(packet(1)), Ok(packet(2))];
            Ok::<AsyncPacketStream, Status>(futures::stream::iter(packets).boxed())
        });
        let queue = CompletionQueue::new();
        let tag = CallTag::from(4);

        let mut stream = client
            .establish(request(Duration::from_secs(10)), tag, queue.notifier())
            .unwrap();
        assert_eq!(queue.next().map(|c| (c.tag, c.ok)), Some((tag, true)));

        for expected in [1, 2] {
            stream.read();
            assert_eq!(queue.next().map(|c| c.ok), Some(true));
            assert_eq!(stream.take_packet(), Some(packet(expected)));
        }

        stream.read();
        assert_eq!(queue.next().map(|c| c.ok), Some(false));
        stream.finish();
        assert_eq!(queue.next().map(|c| c.ok), Some(true));
        assert_eq!(stream.status().code(), Code::Ok);
    }

    #[test]
    fn test_stream_error_status() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let client = TokioExchangeClient::new(runtime.handle().clone(), |_: EstablishRequest| async {
            let packets = vec![Ok(packet(1)), Err(Status::unavailable("node went away"))];
            Ok::<AsyncPacketStream, Status>(futures::stream::iter(packets).boxed())
        });
        let queue = CompletionQueue::new();

        let mut stream = client
            .establish(request(Duration::from_secs(10)), 0.into(), queue.notifier())
            .unwrap();
        assert_eq!(queue.next().map(|c| c.ok), Some(true));
        stream.read();
        assert_eq!(queue.next().map(|c| c.ok), Some(true));
        stream.read();
        assert_eq!(queue.next().map(|c| c.ok), Some(false));
        stream.finish();
        assert_eq!(queue.next().map(|c| c.ok), Some(true));

        let status = stream.status();
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), "node went away");
    }

    #[test]
    fn test_connect_failure() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let client = TokioExchangeClient::new(runtime.handle().clone(), |_: EstablishRequest| async {
            Err::<AsyncPacketStream, Status>(Status::not_found("no such task"))
        });
        let queue = CompletionQueue::new();

        let mut stream = client
            .establish(request(Duration::from_secs(10)), 0.into(), queue.notifier())
            .unwrap();
        assert_eq!(queue.next().map(|c| c.ok), Some(false));
        assert_eq!(stream.status().code(), Code::NotFound);
    }

    #[test]
    fn test_read_deadline() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let client = TokioExchangeClient::new(runtime.handle().clone(), |_: EstablishRequest| async {
            Ok::<AsyncPacketStream, Status>(futures::stream::pending().boxed())
        });
        let queue = CompletionQueue::new();

        let mut stream = client
            .establish(request(Duration::from_millis(50)), 0.into(), queue.notifier())
            .unwrap();
        assert_eq!(queue.next().map(|c| c.ok), Some(true));
        stream.read();
        assert_eq!(queue.next().map(|c| c.ok), Some(false));
        assert_eq!(stream.status().code(), Code::DeadlineExceeded);
    }

    #[test]
    fn test_cancel_outstanding_read() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let client = TokioExchangeClient::new(runtime.handle().clone(), |_: EstablishRequest| async {
            Ok::<AsyncPacketStream, Status>(futures::stream::pending().boxed())
        });
        let queue = CompletionQueue::new();

        let mut stream = client
            .establish(request(Duration::from_secs(60)), 0.into(), queue.notifier())
            .unwrap();
        assert_eq!(queue.next().map(|c| c.ok), Some(true));
        stream.read();
        stream.cancel();
        assert_eq!(queue.next().map(|c| c.ok), Some(false));
        assert_eq!(stream.status().code(), Code::Cancelled);

        // Nothing is outstanding, so cancelling again reports nothing.
        stream.cancel();
        let notifier = queue.notifier();
        notifier.notify(9.into(), true);
        assert_eq!(queue.next().map(|c| c.tag), Some(9.into()));
    }

    #[test]
    fn test_panicking_read() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let client = TokioExchangeClient::new(runtime.handle().clone(), |_: EstablishRequest| async {
            let stream = futures::stream::poll_fn(
                |_| -> std::task::Poll<Option<Result<DataPacket, Status>>> { panic!("transport bug") },
            );
            Ok::<AsyncPacketStream, Status>(stream.boxed())
        });
        let queue = CompletionQueue::new();

        let mut stream = client
            .establish(request(Duration::from_secs(60)), 0.into(), queue.notifier())
            .unwrap();
        assert_eq!(queue.next().map(|c| c.ok), Some(true));
        stream.read();
        assert_eq!(queue.next().map(|c| c.ok), Some(false));
        stream.finish();
        assert_eq!(queue.next().map(|c| c.ok), Some(true));
        assert_eq!(stream.status().code(), Code::Internal);
    }

    #[test]
    fn test_runtime_shutdown_completes_read() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let client = TokioExchangeClient::new(runtime.handle().clone(), |_: EstablishRequest| async {
            Ok::<AsyncPacketStream, Status>(futures::stream::pending().boxed())
        });
        let queue = CompletionQueue::new();

        let mut stream = client
            .establish(request(Duration::from_secs(60)), 0.into(), queue.notifier())
            .unwrap();
        assert_eq!(queue.next().map(|c| c.ok), Some(true));
        stream.read();
        runtime.shutdown_timeout(Duration::from_secs(5));
        assert_eq!(queue.next().map(|c| c.ok), Some(false));
        assert_eq!(stream.status().code(), Code::Internal);

        // The stream is gone, so reading fails immediately.
        stream.read();
        assert_eq!(queue.next().map(|c| c.ok), Some(false));
    }
}

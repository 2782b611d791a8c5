//! Test doubles for driving receivers without a network.
//!
//! [ScriptedClient] is an in-process [ExchangeClient] and [PanickingCodec]
//! a [ChunkCodec] standing in for one that fails on malformed input.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use error_stack::Report;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tonic::{Code, Status};

use crate::client::{ExchangeClient, PacketStream, TransportError};
use crate::codec::{ChunkCodec, DecodeError};
use crate::{CallTag, CompletionNotifier, DataPacket, EstablishRequest, TaskMeta};

/// One step of a sender's script.
///
/// Each read consumes steps up to and including the first one which isn't a
/// [Step::Delay]. Once the script is exhausted the stream ends successfully.
#[derive(Debug, Clone)]
pub enum Step {
    /// The read delivers the packet.
    Packet(DataPacket),
    /// The stream fails with the given status.
    Fail(Status),
    /// The read never completes, unless the call is cancelled.
    Hang,
    /// The following step completes after the delay, from another thread.
    Delay(Duration),
}

/// Serves scripted streams, keyed by the sender task.
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<TaskMeta, VecDeque<Step>>>,
    /// Senders whose establish request can't be issued.
    refused: HashSet<TaskMeta>,
    /// Senders whose establish request completes with an error.
    rejected: HashMap<TaskMeta, Status>,
    established: AtomicUsize,
    cancelled: Arc<AtomicUsize>,
}

impl std::fmt::Debug for ScriptedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedClient")
            .field("established", &self.established())
            .field("cancelled", &self.cancelled())
            .finish_non_exhaustive()
    }
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, sender: TaskMeta, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts.lock().insert(sender, steps.into_iter().collect());
        self
    }

    /// Fail to issue the establish request to `sender`.
    pub fn refusing(mut self, sender: TaskMeta) -> Self {
        self.refused.insert(sender);
        self
    }

    /// Complete the establish request to `sender` with the `status`.
    pub fn rejecting(mut self, sender: TaskMeta, status: Status) -> Self {
        self.rejected.insert(sender, status);
        self
    }

    /// Number of establish requests received.
    pub fn established(&self) -> usize {
        self.established.load(Ordering::SeqCst)
    }

    /// Number of outstanding operations that were cancelled.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl ExchangeClient for ScriptedClient {
    fn establish(
        &self,
        request: EstablishRequest,
        tag: CallTag,
        notifier: CompletionNotifier,
    ) -> error_stack::Result<Box<dyn PacketStream>, TransportError> {
        self.established.fetch_add(1, Ordering::SeqCst);
        let sender = request.sender;
        if self.refused.contains(&sender) {
            return Err(Report::new(TransportError::Start(sender)));
        }

        let steps = self.scripts.lock().remove(&sender).unwrap_or_default();
        let stream = ScriptedStream {
            tag,
            notifier,
            shared: Arc::new(Mutex::new(Script {
                steps,
                ..Script::default()
            })),
            cancelled: self.cancelled.clone(),
        };

        match self.rejected.get(&sender) {
            Some(status) => {
                stream.shared.lock().status = Some(status.clone());
                stream.notifier.notify(tag, false);
            }
            None => {
                stream.notifier.notify(tag, true);
            }
        }
        Ok(Box::new(stream))
    }
}

#[derive(Default)]
struct Script {
    steps: VecDeque<Step>,
    packet: Option<DataPacket>,
    status: Option<Status>,
    outstanding: bool,
}

impl Script {
    /// Apply a step, returning the `ok` to report if the read completed.
    fn complete(&mut self, step: Option<Step>) -> Option<bool> {
        match step {
            Some(Step::Hang) => return None,
            Some(Step::Packet(packet)) => {
                self.packet = Some(packet);
            }
            Some(Step::Fail(status)) => {
                self.steps.clear();
                self.status = Some(status);
            }
            Some(Step::Delay(_)) | None => {}
        }

        self.outstanding = false;
        Some(self.packet.is_some())
    }
}

struct ScriptedStream {
    tag: CallTag,
    notifier: CompletionNotifier,
    shared: Arc<Mutex<Script>>,
    cancelled: Arc<AtomicUsize>,
}

impl PacketStream for ScriptedStream {
    fn read(&mut self) {
        let mut script = self.shared.lock();
        script.outstanding = true;

        let mut delay = Duration::ZERO;
        let step = loop {
            match script.steps.pop_front() {
                Some(Step::Delay(more)) => delay += more,
                step => break step,
            }
        };

        if delay.is_zero() {
            let ok = script.complete(step);
            std::mem::drop(script);
            if let Some(ok) = ok {
                self.notifier.notify(self.tag, ok);
            }
        } else {
            std::mem::drop(script);
            let shared = self.shared.clone();
            let notifier = self.notifier.clone();
            let tag = self.tag;
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                let ok = {
                    let mut script = shared.lock();
                    if !script.outstanding {
                        return;
                    }
                    script.complete(step)
                };
                if let Some(ok) = ok {
                    notifier.notify(tag, ok);
                }
            });
        }
    }

    fn take_packet(&mut self) -> Option<DataPacket> {
        self.shared.lock().packet.take()
    }

    fn finish(&mut self) {
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
        let mut script = self.shared.lock();
        script.steps.clear();
        if script.outstanding {
            script.outstanding = false;
            script.status = Some(Status::cancelled("cancelled by receiver"));
            std::mem::drop(script);

            self.cancelled.fetch_add(1, Ordering::SeqCst);
            self.notifier.notify(self.tag, false);
        }
    }
}

/// A codec which panics on every chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct PanickingCodec;

impl ChunkCodec for PanickingCodec {
    fn decode(
        &self,
        _chunk: &[u8],
        _schema: &SchemaRef,
    ) -> error_stack::Result<Vec<RecordBatch>, DecodeError> {
        panic!("malformed chunk")
    }
}

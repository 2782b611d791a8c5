//! Messages exchanged with the remote sender tasks.
//!
//! `DataPacket` is the message carried by each sender's stream. It is a
//! protobuf message so the stream may be served by any gRPC transport
//! (eg., a `tonic::Streaming<DataPacket>`).

use std::time::Duration;

/// Identifies one task of an MPP query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TaskMeta {
    /// The start timestamp of the query the task belongs to.
    pub start_ts: u64,
    pub task_id: i64,
    /// Address of the node running the task.
    pub address: String,
}

impl TaskMeta {
    pub fn new(start_ts: u64, task_id: i64, address: impl Into<String>) -> Self {
        Self {
            start_ts,
            task_id,
            address: address.into(),
        }
    }
}

impl std::fmt::Display for TaskMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.start_ts, self.task_id, self.address)
    }
}

/// Request sent to a sender task to open its stream of packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishRequest {
    /// The task producing the packets.
    pub sender: TaskMeta,
    /// The task receiving the packets.
    pub receiver: TaskMeta,
    /// Deadline for the call, relative to when it is established.
    pub timeout: Duration,
}

/// The encoding of the chunks in a [DataPacket].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[repr(i32)]
pub enum EncodeType {
    /// Each chunk is an Arrow IPC stream.
    #[display(fmt = "arrow_ipc")]
    ArrowIpc = 1,
    /// Each chunk is newline-delimited JSON, one object per row.
    #[display(fmt = "json_rows")]
    JsonRows = 2,
}

impl TryFrom<i32> for EncodeType {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EncodeType::ArrowIpc),
            2 => Ok(EncodeType::JsonRows),
            unknown => Err(unknown),
        }
    }
}

impl From<EncodeType> for i32 {
    fn from(value: EncodeType) -> Self {
        value as i32
    }
}

/// One packet of a sender's stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DataPacket {
    /// Wire value of the [EncodeType] used by `chunks`.
    #[prost(int32, tag = "1")]
    pub encode_type: i32,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub chunks: Vec<Vec<u8>>,
    /// Set if the sender failed while producing this packet.
    #[prost(message, optional, tag = "3")]
    pub error: Option<PacketError>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PacketError {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub msg: String,
}

impl DataPacket {
    pub fn new(encode_type: EncodeType, chunks: Vec<Vec<u8>>) -> Self {
        Self {
            encode_type: encode_type.into(),
            chunks,
            error: None,
        }
    }

    /// Create a packet reporting a failure on the sender.
    pub fn failure(code: i32, msg: impl Into<String>) -> Self {
        Self {
            encode_type: 0,
            chunks: vec![],
            error: Some(PacketError {
                code,
                msg: msg.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn test_encode_type_wire_values() {
        assert_eq!(EncodeType::try_from(1), Ok(EncodeType::ArrowIpc));
        assert_eq!(EncodeType::try_from(2), Ok(EncodeType::JsonRows));
        assert_eq!(EncodeType::try_from(0), Err(0));
        assert_eq!(EncodeType::try_from(77), Err(77));
        assert_eq!(i32::from(EncodeType::JsonRows), 2);
    }

    #[test]
    fn test_failure_packet_survives_the_wire() {
        let packet = DataPacket::failure(3, "out of memory");
        let bytes = packet.encode_to_vec();
        let decoded = DataPacket::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.error.unwrap().msg, "out of memory");
        assert!(decoded.chunks.is_empty());
    }

    #[test]
    fn test_task_meta_display() {
        let task = TaskMeta::new(42, 7, "10.0.0.3:3930");
        assert_eq!(task.to_string(), "42:7@10.0.0.3:3930");
    }
}

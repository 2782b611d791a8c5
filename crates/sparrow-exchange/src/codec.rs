//! Decoding of the chunks carried by each [DataPacket].
//!
//! Each packet names the encoding of its chunks. The [PacketDecoder]
//! dispatches on that tag to the registered [ChunkCodec] and conforms the
//! decoded batches to the output schema of the receiver.

mod arrow_ipc;
mod json_rows;

use arrow_array::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use error_stack::{IntoReport, ResultExt};
use hashbrown::HashMap;

pub use arrow_ipc::ArrowIpcCodec;
pub use json_rows::JsonRowsCodec;

use crate::{DataPacket, EncodeType};

#[derive(derive_more::Display, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[display(fmt = "unsupported encode type {_0}")]
    Unsupported(i32),
    #[display(fmt = "invalid {_0} chunk")]
    InvalidChunk(EncodeType),
    #[display(fmt = "expected {expected} columns, but chunk had {actual}")]
    ColumnCount { expected: usize, actual: usize },
    #[display(fmt = "expected column {index} to be {expected:?}, but was {actual:?}")]
    ColumnType {
        index: usize,
        expected: DataType,
        actual: DataType,
    },
    #[display(fmt = "unable to relabel decoded batch")]
    Relabel,
}

impl error_stack::Context for DecodeError {}

/// Decodes the chunks of one wire encoding.
///
/// Implementations must be deterministic and free of side effects. They are
/// run on the multiplexer thread, so they should not block.
pub trait ChunkCodec: Send + Sync {
    /// Decode one chunk into zero or more batches.
    ///
    /// The `schema` is the output schema of the receiver. Codecs may use it
    /// to interpret the chunk, but do not need to label the columns with it.
    fn decode(
        &self,
        chunk: &[u8],
        schema: &SchemaRef,
    ) -> error_stack::Result<Vec<RecordBatch>, DecodeError>;
}

/// Decodes packets into batches of the output schema.
pub struct PacketDecoder {
    schema: SchemaRef,
    codecs: HashMap<EncodeType, Box<dyn ChunkCodec>>,
}

impl std::fmt::Debug for PacketDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketDecoder")
            .field("schema", &self.schema)
            .field("codecs", &self.codecs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PacketDecoder {
    /// Create a decoder supporting all of the built-in encodings.
    pub fn new(schema: SchemaRef) -> Self {
        Self::empty(schema)
            .with_codec(EncodeType::ArrowIpc, ArrowIpcCodec)
            .with_codec(EncodeType::JsonRows, JsonRowsCodec)
    }

    /// Create a decoder with no registered codecs.
    pub fn empty(schema: SchemaRef) -> Self {
        Self {
            schema,
            codecs: HashMap::new(),
        }
    }

    /// Register (or replace) the codec used for `encode_type`.
    pub fn with_codec(mut self, encode_type: EncodeType, codec: impl ChunkCodec + 'static) -> Self {
        self.codecs.insert(encode_type, Box::new(codec));
        self
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Decode all chunks of the packet, in order.
    ///
    /// A packet without chunks decodes to no batches, whatever its encode
    /// type. Batches without rows are dropped.
    pub fn decode(&self, packet: &DataPacket) -> error_stack::Result<Vec<RecordBatch>, DecodeError> {
        if packet.chunks.is_empty() {
            return Ok(vec![]);
        }

        let codec = EncodeType::try_from(packet.encode_type)
            .ok()
            .and_then(|encode_type| self.codecs.get(&encode_type))
            .ok_or(DecodeError::Unsupported(packet.encode_type))?;

        let mut batches = Vec::with_capacity(packet.chunks.len());
        for chunk in &packet.chunks {
            for batch in codec.decode(chunk, &self.schema)? {
                if batch.num_rows() > 0 {
                    batches.push(self.conform(batch)?);
                }
            }
        }
        tracing::trace!(
            "Decoded {} chunks into {} batches",
            packet.chunks.len(),
            batches.len()
        );
        Ok(batches)
    }

    /// Check the batch against the output schema and relabel its columns.
    fn conform(&self, batch: RecordBatch) -> error_stack::Result<RecordBatch, DecodeError> {
        let expected = self.schema.fields();
        error_stack::ensure!(
            batch.num_columns() == expected.len(),
            DecodeError::ColumnCount {
                expected: expected.len(),
                actual: batch.num_columns(),
            }
        );

        for (index, (field, column)) in expected.iter().zip(batch.columns()).enumerate() {
            error_stack::ensure!(
                field.data_type() == column.data_type(),
                DecodeError::ColumnType {
                    index,
                    expected: field.data_type().clone(),
                    actual: column.data_type().clone(),
                }
            );
        }

        RecordBatch::try_new(self.schema.clone(), batch.columns().to_vec())
            .into_report()
            .change_context(DecodeError::Relabel)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_array::cast::AsArray;
    use arrow_array::Int64Array;
    use arrow_schema::{Field, Schema};

    use super::*;

    fn output_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]))
    }

    #[test]
    fn test_decode_ipc_packet_relabels_columns() {
        let batch = sparrow_testing::int64_batch("remote_name", &[1, 2, 3]);
        let packet = DataPacket::new(
            EncodeType::ArrowIpc,
            vec![sparrow_testing::encode_ipc(&[batch])],
        );

        let batches = PacketDecoder::new(output_schema()).decode(&packet).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].schema(), output_schema());
        assert_eq!(
            batches[0].column(0).as_primitive(),
            &Int64Array::from(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_decode_chunks_in_order() {
        let first = sparrow_testing::int64_batch("a", &[1]);
        let second = sparrow_testing::int64_batch("a", &[2, 3]);
        let packet = DataPacket::new(
            EncodeType::JsonRows,
            vec![
                sparrow_testing::encode_json_rows(&first),
                sparrow_testing::encode_json_rows(&second),
            ],
        );

        let batches = PacketDecoder::new(output_schema()).decode(&packet).unwrap();
        let rows: Vec<usize> = batches.iter().map(RecordBatch::num_rows).collect();
        assert_eq!(rows, vec![1, 2]);
    }

    #[test]
    fn test_empty_packet_decodes_to_nothing() {
        let packet = DataPacket {
            encode_type: 99,
            chunks: vec![],
            error: None,
        };
        let batches = PacketDecoder::new(output_schema()).decode(&packet).unwrap();
        assert!(batches.is_empty());
    }

    #[test]
    fn test_unknown_encode_type() {
        let packet = DataPacket {
            encode_type: 99,
            chunks: vec![b"{}".to_vec()],
            error: None,
        };
        let err = PacketDecoder::new(output_schema())
            .decode(&packet)
            .unwrap_err();
        assert_eq!(err.current_context(), &DecodeError::Unsupported(99));
    }

    #[test]
    fn test_unregistered_encode_type() {
        let batch = sparrow_testing::int64_batch("a", &[1]);
        let packet = DataPacket::new(
            EncodeType::JsonRows,
            vec![sparrow_testing::encode_json_rows(&batch)],
        );
        let decoder = PacketDecoder::empty(output_schema())
            .with_codec(EncodeType::ArrowIpc, ArrowIpcCodec);

        let err = decoder.decode(&packet).unwrap_err();
        assert_eq!(err.current_context(), &DecodeError::Unsupported(2));
    }

    #[test]
    fn test_column_type_mismatch() {
        let batch = sparrow_testing::utf8_batch("a", &["x"]);
        let packet = DataPacket::new(
            EncodeType::ArrowIpc,
            vec![sparrow_testing::encode_ipc(&[batch])],
        );

        let err = PacketDecoder::new(output_schema())
            .decode(&packet)
            .unwrap_err();
        assert_eq!(
            err.current_context(),
            &DecodeError::ColumnType {
                index: 0,
                expected: DataType::Int64,
                actual: DataType::Utf8,
            }
        );
    }
}

use std::io::Cursor;

use arrow_array::RecordBatch;
use arrow_ipc::reader::StreamReader;
use arrow_schema::SchemaRef;
use error_stack::{IntoReport, ResultExt};
use itertools::Itertools;

use crate::codec::{ChunkCodec, DecodeError};
use crate::EncodeType;

/// Codec for chunks containing an Arrow IPC stream.
///
/// Each chunk is a complete stream (schema message followed by zero or more
/// record batches), so chunks may be decoded independently.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrowIpcCodec;

impl ChunkCodec for ArrowIpcCodec {
    fn decode(
        &self,
        chunk: &[u8],
        _schema: &SchemaRef,
    ) -> error_stack::Result<Vec<RecordBatch>, DecodeError> {
        let reader = StreamReader::try_new(Cursor::new(chunk), None)
            .into_report()
            .change_context(DecodeError::InvalidChunk(EncodeType::ArrowIpc))?;
        reader
            .try_collect()
            .into_report()
            .change_context(DecodeError::InvalidChunk(EncodeType::ArrowIpc))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    #[test]
    fn test_truncated_chunk_is_invalid() {
        let batch = sparrow_testing::int64_batch("a", &[1, 2, 3, 4]);
        let mut chunk = sparrow_testing::encode_ipc(&[batch]);
        // Keep the continuation marker, but cut the metadata length.
        chunk.truncate(6);

        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
        let err = ArrowIpcCodec.decode(&chunk, &schema).unwrap_err();
        assert_eq!(
            err.current_context(),
            &DecodeError::InvalidChunk(EncodeType::ArrowIpc)
        );
    }

    #[test]
    fn test_multiple_batches_in_one_chunk() {
        let chunk = sparrow_testing::encode_ipc(&[
            sparrow_testing::int64_batch("a", &[1, 2]),
            sparrow_testing::int64_batch("a", &[3]),
        ]);

        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
        let batches = ArrowIpcCodec.decode(&chunk, &schema).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].num_rows(), 1);
    }
}

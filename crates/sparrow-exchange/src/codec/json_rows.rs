use std::io::Cursor;

use arrow_array::RecordBatch;
use arrow_json::ReaderBuilder;
use arrow_schema::SchemaRef;
use error_stack::{IntoReport, ResultExt};
use itertools::Itertools;

use crate::codec::{ChunkCodec, DecodeError};
use crate::EncodeType;

/// Codec for chunks of newline-delimited JSON objects.
///
/// Objects are keyed by the names of the output schema. The column types
/// are taken from the output schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRowsCodec;

impl ChunkCodec for JsonRowsCodec {
    fn decode(
        &self,
        chunk: &[u8],
        schema: &SchemaRef,
    ) -> error_stack::Result<Vec<RecordBatch>, DecodeError> {
        let reader = ReaderBuilder::new(schema.clone())
            .build(Cursor::new(chunk))
            .into_report()
            .change_context(DecodeError::InvalidChunk(EncodeType::JsonRows))?;
        reader
            .try_collect()
            .into_report()
            .change_context(DecodeError::InvalidChunk(EncodeType::JsonRows))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_array::cast::AsArray;
    use arrow_array::StringArray;
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    #[test]
    fn test_decode_rows() {
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Utf8, true)]));
        let chunk = b"{\"x\": \"a\"}\n{\"x\": null}\n{\"x\": \"c\"}\n";

        let batches = JsonRowsCodec.decode(chunk, &schema).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].column(0).as_string::<i32>(),
            &StringArray::from(vec![Some("a"), None, Some("c")])
        );
    }

    #[test]
    fn test_malformed_rows() {
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, true)]));
        let err = JsonRowsCodec
            .decode(b"{\"x\": 1}\n{\"x\": ", &schema)
            .unwrap_err();
        assert_eq!(
            err.current_context(),
            &DecodeError::InvalidChunk(EncodeType::JsonRows)
        );
    }
}

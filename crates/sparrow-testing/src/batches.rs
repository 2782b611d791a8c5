//! Builders for small batches and the chunks carrying them.
//!
//! These panic on failure, since they are only used by tests.

use std::sync::Arc;

use arrow_array::{ArrayRef, Int64Array, RecordBatch, StringArray};
use arrow_schema::{Field, Schema};

/// Create a batch with a single nullable `Int64` column.
pub fn int64_batch(name: &str, values: &[i64]) -> RecordBatch {
    let column: ArrayRef = Arc::new(Int64Array::from(values.to_vec()));
    single_column(name, column)
}

/// Create a batch with a single nullable `Utf8` column.
pub fn utf8_batch(name: &str, values: &[&str]) -> RecordBatch {
    let column: ArrayRef = Arc::new(StringArray::from(values.to_vec()));
    single_column(name, column)
}

fn single_column(name: &str, column: ArrayRef) -> RecordBatch {
    let schema = Schema::new(vec![Field::new(name, column.data_type().clone(), true)]);
    RecordBatch::try_new(Arc::new(schema), vec![column]).unwrap()
}

/// Encode the batches as one Arrow IPC stream.
///
/// All batches must have the same schema.
pub fn encode_ipc(batches: &[RecordBatch]) -> Vec<u8> {
    let schema = batches
        .first()
        .map(|batch| batch.schema())
        .expect("at least one batch");

    let mut writer = arrow_ipc::writer::StreamWriter::try_new(Vec::new(), &schema).unwrap();
    for batch in batches {
        writer.write(batch).unwrap();
    }
    writer.finish().unwrap();
    writer.into_inner().unwrap()
}

/// Encode the rows of the batch as newline-delimited JSON objects.
pub fn encode_json_rows(batch: &RecordBatch) -> Vec<u8> {
    let mut writer = arrow_json::LineDelimitedWriter::new(Vec::new());
    writer.write(batch).unwrap();
    writer.finish().unwrap();
    writer.into_inner()
}

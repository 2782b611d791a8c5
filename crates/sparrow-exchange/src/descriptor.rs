use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};

use crate::TaskMeta;

/// One column produced by every sender.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ColumnDesc {
    /// Name of the column.
    ///
    /// Columns without a name are named by their position.
    pub name: Option<String>,
    pub data_type: DataType,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: Some(name.into()),
            data_type,
        }
    }

    pub fn unnamed(data_type: DataType) -> Self {
        Self {
            name: None,
            data_type,
        }
    }
}

/// Describes what an exchange receiver pulls and from where.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReceiverDescriptor {
    /// The task owning the receiver.
    pub receiver: TaskMeta,
    /// The tasks to pull from, in order.
    ///
    /// The index of a sender in this list is the tag of its call.
    pub senders: Vec<TaskMeta>,
    /// The columns produced by all senders, in order.
    pub columns: Vec<ColumnDesc>,
}

impl ReceiverDescriptor {
    /// Return the schema of the batches produced by the receiver.
    pub fn output_schema(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .enumerate()
            .map(|(index, column)| {
                let name = match &column.name {
                    Some(name) => name.clone(),
                    None => format!("exchange_receiver_{index}"),
                };
                Field::new(name, column.data_type.clone(), true)
            })
            .collect();
        Arc::new(Schema::new(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_schema_preserves_order_and_names() {
        let descriptor = ReceiverDescriptor {
            receiver: TaskMeta::new(1, 0, "local"),
            senders: vec![],
            columns: vec![
                ColumnDesc::new("b", DataType::Utf8),
                ColumnDesc::unnamed(DataType::Int64),
                ColumnDesc::new("a", DataType::Float64),
            ],
        };

        let schema = descriptor.output_schema();
        let names: Vec<_> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["b", "exchange_receiver_1", "a"]);
        assert_eq!(schema.field(1).data_type(), &DataType::Int64);
        assert!(schema.field(0).is_nullable());
    }

    #[test]
    fn test_descriptor_from_json() {
        let descriptor: ReceiverDescriptor = serde_json::from_str(
            r#"{
                "receiver": { "start_ts": 5, "task_id": -1, "address": "" },
                "senders": [
                    { "start_ts": 5, "task_id": 1, "address": "node-1:3930" },
                    { "start_ts": 5, "task_id": 2, "address": "node-2:3930" }
                ],
                "columns": [ { "name": "a", "data_type": "Int64" } ]
            }"#,
        )
        .unwrap();

        assert_eq!(descriptor.senders.len(), 2);
        assert_eq!(descriptor.senders[1].address, "node-2:3930");
        assert_eq!(
            descriptor.columns,
            vec![ColumnDesc::new("a", DataType::Int64)]
        );
    }
}

use std::time::Duration;

/// Options affecting an [ExchangeReceiver](crate::ExchangeReceiver).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    /// Deadline attached to the call to each sender.
    pub timeout: Duration,
    /// The maximum number of decoded batches waiting for the consumer.
    ///
    /// When the buffer is full the multiplexer stops reading from the
    /// senders until a batch is taken. `None` for no limit.
    pub max_buffered_batches: Option<usize>,
    /// Whether to cancel the remaining calls once one of them fails.
    pub cancel_on_error: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_buffered_batches: Some(64),
            cancel_on_error: true,
        }
    }
}

impl ExchangeOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_buffered_batches(mut self, max_buffered_batches: Option<usize>) -> Self {
        self.max_buffered_batches = max_buffered_batches;
        self
    }

    pub fn with_cancel_on_error(mut self, cancel_on_error: bool) -> Self {
        self.cancel_on_error = cancel_on_error;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let options: ExchangeOptions =
            serde_json::from_str(r#"{ "max_buffered_batches": null }"#).unwrap();
        assert_eq!(
            options,
            ExchangeOptions {
                timeout: Duration::from_secs(10),
                max_buffered_batches: None,
                cancel_on_error: true,
            }
        );
    }

    #[test]
    fn test_timeout_from_json() {
        let options: ExchangeOptions =
            serde_json::from_str(r#"{ "timeout": { "secs": 2, "nanos": 500000000 } }"#).unwrap();
        assert_eq!(options.timeout, Duration::from_millis(2500));
        assert_eq!(options.max_buffered_batches, Some(64));
    }
}
